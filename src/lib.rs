// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Supervisor for the gantry worker group: a watchdog, one actuator per axis, and two operator
//!   consoles, wired together through named pipes and a shared log file.

pub mod config;
pub mod error;
pub mod fifo;
pub mod fork;
pub mod handoff;
pub mod log;
pub mod monitor;
pub mod procs;
pub mod shutdown;
pub mod supervisor;

pub use error::Error;
