//! Wake-token routing.
//!
//! Every reactor registration carries a token whose high byte tags the wake
//! source; the low bits carry a descriptor or channel index where needed.

use std::os::fd::RawFd;

use ark_reactor::{Token, Wake};

const TAG_SHIFT: u64 = 56;
const VALUE_MASK: u64 = (1 << TAG_SHIFT) - 1;

const TAG_LISTENER: u64 = 1;
const TAG_CONN: u64 = 2;
const TAG_CHILD_STDOUT: u64 = 3;
const TAG_CHILD_STDERR: u64 = 4;
const TAG_CHANNEL: u64 = 5;
const TAG_REPLY_TIMER: u64 = 6;
const TAG_ACK_TIMER: u64 = 7;

const fn tagged(tag: u64, value: u64) -> Token {
    Token(tag << TAG_SHIFT | (value & VALUE_MASK))
}

pub(crate) const fn listener() -> Token {
    tagged(TAG_LISTENER, 0)
}

pub(crate) const fn conn_fd(fd: RawFd) -> Token {
    tagged(TAG_CONN, fd as u64)
}

pub(crate) const fn child_stdout() -> Token {
    tagged(TAG_CHILD_STDOUT, 0)
}

pub(crate) const fn child_stderr() -> Token {
    tagged(TAG_CHILD_STDERR, 0)
}

pub(crate) const fn channel(index: usize) -> Token {
    tagged(TAG_CHANNEL, index as u64)
}

pub(crate) const fn reply_timer() -> Token {
    tagged(TAG_REPLY_TIMER, 0)
}

pub(crate) const fn ack_timer() -> Token {
    tagged(TAG_ACK_TIMER, 0)
}

/// Decoded wake destination.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Route {
    Listener,
    Conn(RawFd),
    ChildStdout,
    ChildStderr,
    Channel(usize),
    ReplyTimer,
    AckTimer,
    Unknown,
}

pub(crate) fn route(wake: Wake) -> Route {
    let token = match wake {
        Wake::Readable(token) | Wake::Timer(token) => token,
    };
    let value = token.0 & VALUE_MASK;
    match token.0 >> TAG_SHIFT {
        TAG_LISTENER => Route::Listener,
        TAG_CONN => Route::Conn(value as RawFd),
        TAG_CHILD_STDOUT => Route::ChildStdout,
        TAG_CHILD_STDERR => Route::ChildStderr,
        TAG_CHANNEL => Route::Channel(value as usize),
        TAG_REPLY_TIMER => Route::ReplyTimer,
        TAG_ACK_TIMER => Route::AckTimer,
        _ => Route::Unknown,
    }
}
