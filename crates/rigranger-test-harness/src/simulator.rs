//! A stateful stand-in for a radio behind `rigctld`.
//!
//! [`SimulatedRig`] keeps frequency, mode, PTT and levels in memory and
//! answers the subset of the control protocol rigranger issues. Both the
//! long (`\set_freq`) and single-letter (`F`) command forms are accepted.

use std::collections::HashMap;

use crate::mock_rigctld::MockReply;

/// Hamlib's "invalid parameter" status.
const RIG_EINVAL: i32 = -1;
/// Hamlib's "function not implemented" status.
const RIG_ENIMPL: i32 = -4;

/// In-memory radio state.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedRig {
    pub frequency: f64,
    pub mode: String,
    pub passband: i64,
    pub ptt: bool,
    pub levels: HashMap<String, f64>,
}

impl Default for SimulatedRig {
    fn default() -> Self {
        let mut levels = HashMap::new();
        levels.insert("STRENGTH".to_string(), -54.0);
        levels.insert("RFPOWER".to_string(), 0.5);
        levels.insert("AF".to_string(), 0.25);
        Self {
            frequency: 14_074_000.0,
            mode: "USB".to_string(),
            passband: 2400,
            ptt: false,
            levels,
        }
    }
}

impl SimulatedRig {
    /// Answer one command line.
    pub fn handle(&mut self, line: &str) -> MockReply {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return MockReply::Silent;
        };
        let args: Vec<&str> = parts.collect();

        match verb.trim_start_matches('\\') {
            "get_freq" | "f" => MockReply::value(self.frequency),
            "set_freq" | "F" => match args.first().and_then(|a| a.parse::<f64>().ok()) {
                Some(hz) if hz > 0.0 => {
                    self.frequency = hz;
                    MockReply::ok()
                }
                _ => MockReply::error(RIG_EINVAL),
            },
            // rigctld prints mode and passband on separate lines.
            "get_mode" | "m" => MockReply::raw(format!("{}\n{}\nRPRT 0\n", self.mode, self.passband)),
            "set_mode" | "M" => {
                let Some(mode) = args.first() else {
                    return MockReply::error(RIG_EINVAL);
                };
                let passband = match args.get(1).map(|p| p.parse::<i64>()) {
                    Some(Ok(p)) => p,
                    Some(Err(_)) => return MockReply::error(RIG_EINVAL),
                    None => 0,
                };
                self.mode = mode.to_string();
                self.passband = passband;
                MockReply::ok()
            }
            "get_ptt" | "t" => MockReply::value(u8::from(self.ptt)),
            "set_ptt" | "T" => match args.first().and_then(|a| a.parse::<i64>().ok()) {
                Some(value) => {
                    self.ptt = value != 0;
                    MockReply::ok()
                }
                None => MockReply::error(RIG_EINVAL),
            },
            "get_level" | "l" => match args.first().and_then(|name| self.levels.get(*name)) {
                Some(value) => MockReply::value(value),
                None => MockReply::error(RIG_EINVAL),
            },
            "set_level" | "L" => {
                let (Some(name), Some(value)) = (args.first(), args.get(1).and_then(|v| v.parse::<f64>().ok()))
                else {
                    return MockReply::error(RIG_EINVAL);
                };
                self.levels.insert(name.to_string(), value);
                MockReply::ok()
            }
            "quit" | "q" => MockReply::Hangup,
            _ => MockReply::error(RIG_ENIMPL),
        }
    }
}
