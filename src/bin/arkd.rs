//! `arkd` — the ark backup request-dispatch daemon.
//!
//! The binary is deliberately thin: select the transport/security driver,
//! seed the service allow-list and configuration overrides, then hand
//! control to the daemon core. All operational results travel over the wire
//! protocol; the only local surface is the tracing log.

use std::error::Error;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use ark_daemon::{Config, Daemon, ServiceTable};
use ark_reactor::PollReactor;
use ark_transport::{Authorizer, Listener, shell, tcp, udp};

fn clap_command() -> Command {
    Command::new("arkd")
        .about("Request-dispatch daemon for the ark backup system")
        .arg(
            Arg::new("auth")
                .long("auth")
                .value_parser(["udp", "tcp", "shell"])
                .default_value("udp")
                .help("Transport/security driver to serve."),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Address to bind for the socket drivers."),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("Port to listen on for the socket drivers."),
        )
        .arg(
            Arg::new("libexec-dir")
                .long("libexec-dir")
                .value_name("DIR")
                .help("Directory holding the service executables."),
        )
        .arg(
            Arg::new("enable-service")
                .long("enable-service")
                .value_name("NAME")
                .action(ArgAction::Append)
                .help("Enable a service by name."),
        )
        .arg(
            Arg::new("disable-service")
                .long("disable-service")
                .value_name("NAME")
                .action(ArgAction::Append)
                .help("Disable a service by name."),
        )
        .arg(
            Arg::new("override")
                .short('o')
                .value_name("KEY=VALUE")
                .action(ArgAction::Append)
                .help("Set a configuration key."),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Log at debug verbosity."),
        )
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(matches: &ArgMatches) -> Config {
    let mut config = Config::new();
    if let Some(overrides) = matches.get_many::<String>("override") {
        for pair in overrides {
            match pair.split_once('=') {
                Some((key, value)) => config.set(key, value),
                None => warn!(pair, "ignoring override without '='"),
            }
        }
    }
    if let Some(dir) = matches.get_one::<String>("libexec-dir") {
        config.set("libexec-dir", dir.clone());
    }
    config
}

fn build_services(matches: &ArgMatches, config: &Config) -> ServiceTable {
    let mut services = ServiceTable::standard(&config.libexec_dir());
    if let Some(names) = matches.get_many::<String>("enable-service") {
        for name in names {
            if !services.set_enabled(name, true) {
                warn!(name, "cannot enable unknown service");
            }
        }
    }
    if let Some(names) = matches.get_many::<String>("disable-service") {
        for name in names {
            if !services.set_enabled(name, false) {
                warn!(name, "cannot disable unknown service");
            }
        }
    }
    services
}

fn build_listener(
    matches: &ArgMatches,
    config: &Config,
) -> Result<Box<dyn Listener>, Box<dyn Error>> {
    let auth = Authorizer::new(config.auth_users());
    let bind_ip: IpAddr = match matches.get_one::<String>("bind") {
        Some(raw) => raw.parse()?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };

    let variant = matches
        .get_one::<String>("auth")
        .map(String::as_str)
        .unwrap_or("udp");
    Ok(match variant {
        "tcp" => {
            let port = matches
                .get_one::<u16>("port")
                .copied()
                .unwrap_or(tcp::DEFAULT_PORT);
            Box::new(tcp::TcpDriverListener::new(
                SocketAddr::new(bind_ip, port),
                auth,
            ))
        }
        "shell" => Box::new(shell::StdioListener::new(config.shell_remote_user())),
        _ => {
            let port = matches
                .get_one::<u16>("port")
                .copied()
                .unwrap_or(udp::DEFAULT_PORT);
            Box::new(udp::UdpDriverListener::new(
                SocketAddr::new(bind_ip, port),
                auth,
            ))
        }
    })
}

fn run(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let config = build_config(matches);
    let services = build_services(matches, &config);
    let listener = build_listener(matches, &config)?;

    let mut daemon = Daemon::new(PollReactor::new(), listener, services, config);
    daemon.run()?;
    Ok(())
}

fn main() -> ExitCode {
    let matches = clap_command().get_matches();
    init_tracing(matches.get_flag("debug"));

    match run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "daemon failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_parse_with_defaults() {
        let matches = clap_command()
            .try_get_matches_from(["arkd"])
            .expect("defaults parse");
        assert_eq!(
            matches.get_one::<String>("auth").map(String::as_str),
            Some("udp")
        );
        assert!(!matches.get_flag("debug"));
    }

    #[test]
    fn overrides_and_toggles_parse() {
        let matches = clap_command()
            .try_get_matches_from([
                "arkd",
                "--auth",
                "tcp",
                "--port",
                "10081",
                "-o",
                "reply-timeout=5",
                "--disable-service",
                "sendbackup",
            ])
            .expect("arguments parse");
        let config = build_config(&matches);
        assert_eq!(config.lookup("reply-timeout"), Some("5"));
        assert_eq!(matches.get_one::<u16>("port"), Some(&10081));
    }

    #[test]
    fn unknown_auth_variant_is_rejected() {
        assert!(
            clap_command()
                .try_get_matches_from(["arkd", "--auth", "carrier-pigeon"])
                .is_err()
        );
    }
}
