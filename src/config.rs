// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Where the workers live, where their channels go, and how long the watchdog gets to show up.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Arg, ArgMatches};

use crate::fifo::ChannelRole;
use crate::Error;

pub const LOG_FILE: &str = "log-file";
pub const CHANNEL_DIR: &str = "channel-dir";
pub const WATCHDOG: &str = "watchdog";
pub const ACTUATOR: &str = "actuator";
pub const COMMAND_CONSOLE: &str = "command-console";
pub const INSPECTION_CONSOLE: &str = "inspection-console";
pub const TERMINAL: &str = "terminal";
pub const NO_TERMINAL: &str = "no-terminal";
pub const HANDOFF_TIMEOUT: &str = "handoff-timeout";
pub const LENIENT_EXIT: &str = "lenient-exit";

const DEFAULT_LOG_FILE: &str = "./sources/log/log_file.txt";
const DEFAULT_CHANNEL_DIR: &str = "/tmp";
const DEFAULT_WATCHDOG: &str = "./exes/watchdog";
const DEFAULT_ACTUATOR: &str = "./exes/motor";
const DEFAULT_COMMAND_CONSOLE: &str = "./exes/command_console";
const DEFAULT_INSPECTION_CONSOLE: &str = "./exes/inspection_console";
const DEFAULT_TERMINAL: &str = "/usr/bin/konsole -e";
const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

/// The fixed worker topology and the resources it is wired through
#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    /// Shared log artifact, truncated on every start
    pub log_file: PathBuf,
    /// Directory holding every channel, the handoff channel included
    pub channel_dir: PathBuf,
    pub watchdog: String,
    /// Both actuator workers run the same executable, one per axis
    pub actuator: String,
    pub command_console: String,
    pub inspection_console: String,
    /// Program and flags the consoles are wrapped in, e.g. `konsole -e`
    pub terminal: Option<Vec<String>>,
    /// Upper bound on waiting for the watchdog to open the handoff channel
    pub handoff_timeout: Duration,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            channel_dir: PathBuf::from(DEFAULT_CHANNEL_DIR),
            watchdog: DEFAULT_WATCHDOG.to_string(),
            actuator: DEFAULT_ACTUATOR.to_string(),
            command_console: DEFAULT_COMMAND_CONSOLE.to_string(),
            inspection_console: DEFAULT_INSPECTION_CONSOLE.to_string(),
            terminal: Some(split_terminal(DEFAULT_TERMINAL)),
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
        }
    }
}

impl Topology {
    pub fn channel_path(&self, role: ChannelRole) -> PathBuf {
        self.channel_dir.join(role.file_name())
    }

    /// Builds the topology from parsed command line arguments, see [`args`]
    pub fn from_matches(args: &ArgMatches<'_>) -> Result<Self, Error> {
        let defaults = Self::default();
        let value = |name: &str, default: &str| -> String {
            args.value_of(name).unwrap_or(default).to_string()
        };

        let terminal = if args.is_present(NO_TERMINAL) {
            None
        } else {
            let terminal = split_terminal(args.value_of(TERMINAL).unwrap_or(DEFAULT_TERMINAL));
            if terminal.is_empty() {
                None
            } else {
                Some(terminal)
            }
        };

        let handoff_timeout = match args.value_of(HANDOFF_TIMEOUT) {
            Some(timeout) => parse_secs(timeout)
                .map(Duration::from_millis)
                .map_err(|e| format!("bad {}: {}", HANDOFF_TIMEOUT, e))?,
            None => defaults.handoff_timeout,
        };

        Ok(Self {
            log_file: args
                .value_of(LOG_FILE)
                .map(PathBuf::from)
                .unwrap_or(defaults.log_file),
            channel_dir: args
                .value_of(CHANNEL_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.channel_dir),
            watchdog: value(WATCHDOG, DEFAULT_WATCHDOG),
            actuator: value(ACTUATOR, DEFAULT_ACTUATOR),
            command_console: value(COMMAND_CONSOLE, DEFAULT_COMMAND_CONSOLE),
            inspection_console: value(INSPECTION_CONSOLE, DEFAULT_INSPECTION_CONSOLE),
            terminal,
            handoff_timeout,
        })
    }
}

fn split_terminal(terminal: &str) -> Vec<String> {
    terminal.split_whitespace().map(str::to_string).collect()
}

/// Seconds with an optional fraction, returned as whole milliseconds
fn parse_secs(secs: &str) -> Result<u64, String> {
    let secs: f64 = secs
        .trim()
        .parse()
        .map_err(|_| format!("{} is not a number of seconds", secs))?;

    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("{} is not a positive number of seconds", secs));
    }

    Ok((secs * 1000.0).round() as u64)
}

/// All options understood by the supervisor
pub fn args() -> Vec<Arg<'static, 'static>> {
    vec![
        Arg::with_name(LOG_FILE)
            .long(LOG_FILE)
            .value_name("PATH")
            .takes_value(true)
            .help("log file shared by the supervisor and every worker (truncated on start)"),
        Arg::with_name(CHANNEL_DIR)
            .long(CHANNEL_DIR)
            .value_name("DIR")
            .takes_value(true)
            .help("directory the named pipes are created in"),
        Arg::with_name(WATCHDOG)
            .long(WATCHDOG)
            .value_name("PATH")
            .takes_value(true)
            .help("watchdog executable"),
        Arg::with_name(ACTUATOR)
            .long(ACTUATOR)
            .value_name("PATH")
            .takes_value(true)
            .help("actuator executable, launched once per axis"),
        Arg::with_name(COMMAND_CONSOLE)
            .long(COMMAND_CONSOLE)
            .value_name("PATH")
            .takes_value(true)
            .help("command console executable"),
        Arg::with_name(INSPECTION_CONSOLE)
            .long(INSPECTION_CONSOLE)
            .value_name("PATH")
            .takes_value(true)
            .help("inspection console executable"),
        Arg::with_name(TERMINAL)
            .long(TERMINAL)
            .value_name("COMMAND")
            .takes_value(true)
            .conflicts_with(NO_TERMINAL)
            .help("terminal emulator (and its flags) the consoles are run in"),
        Arg::with_name(NO_TERMINAL)
            .long(NO_TERMINAL)
            .help("run the consoles directly, without a terminal emulator"),
        Arg::with_name(HANDOFF_TIMEOUT)
            .long(HANDOFF_TIMEOUT)
            .value_name("SECONDS")
            .takes_value(true)
            .validator(|secs| parse_secs(&secs).map(|_| ()))
            .help("how long to wait for the watchdog to open the handoff pipe"),
        Arg::with_name(LENIENT_EXIT)
            .long(LENIENT_EXIT)
            .help("always exit with status 0, even when the topology could not be established"),
    ]
}
