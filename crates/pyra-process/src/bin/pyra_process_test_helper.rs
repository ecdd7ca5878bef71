//! Stand-in interpreter for integration tests.
//!
//! Invoked like the real interpreter (`<helper> [interpreter args] <script>`),
//! it ignores everything but the last argument and executes that file as a
//! list of directives, one per line:
//!
//! ```text
//! print <text>        stdout line
//! eprint <text>       stderr line
//! write <text>        stdout without newline (flushed)
//! sleep <ms>
//! ignore-sigterm
//! print-args          all arguments, space separated
//! print-env <NAME>
//! exit <code>
//! ```

use std::{
    env, fs,
    io::{self, Write},
    process, thread,
    time::Duration,
};

fn parse_u64(value: &str, directive: &str) -> u64 {
    value.trim().parse().unwrap_or_else(|_| {
        eprintln!("invalid number for {directive}: {value}");
        process::exit(2);
    })
}

#[cfg(unix)]
fn ignore_sigterm() {
    // SAFETY: installing SIG_IGN has no preconditions.
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_sigterm() {}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(script) = args.last() else {
        eprintln!("usage: pyra_process_test_helper [args...] <script>");
        process::exit(2);
    };
    let text = fs::read_to_string(script).unwrap_or_else(|err| {
        eprintln!("failed to read {script}: {err}");
        process::exit(2);
    });

    let stdout = io::stdout();
    let stderr = io::stderr();
    for line in text.lines() {
        let (directive, rest) = line.split_once(' ').unwrap_or((line, ""));
        match directive {
            "print" => {
                let mut out = stdout.lock();
                let _ = writeln!(out, "{rest}");
                let _ = out.flush();
            }
            "eprint" => {
                let mut err = stderr.lock();
                let _ = writeln!(err, "{rest}");
                let _ = err.flush();
            }
            "write" => {
                let mut out = stdout.lock();
                let _ = write!(out, "{rest}");
                let _ = out.flush();
            }
            "sleep" => thread::sleep(Duration::from_millis(parse_u64(rest, "sleep"))),
            "ignore-sigterm" => ignore_sigterm(),
            "print-args" => {
                let mut out = stdout.lock();
                let _ = writeln!(out, "{}", args.join(" "));
                let _ = out.flush();
            }
            "print-env" => {
                let value = env::var(rest.trim()).unwrap_or_default();
                let mut out = stdout.lock();
                let _ = writeln!(out, "{value}");
                let _ = out.flush();
            }
            "exit" => process::exit(parse_u64(rest, "exit") as i32),
            "" => {}
            other => {
                eprintln!("unknown directive: {other}");
                process::exit(2);
            }
        }
    }
}
