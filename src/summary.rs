// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Connection and run statistics gleaned from the target inventory, with
//! errors classified by substring match against a fixed vocabulary.

use std::collections::HashMap;
use std::time::Duration;

use crate::utils::output;
use crate::Env;

/// The failure modes worth counting separately. Everything else lands in
/// the [`UNKNOWN_ERROR`] bucket.
pub const ERROR_VOCABULARY: [&str; 14] = [
    "connection refused",
    "too many open files",
    "connection reset by peer",
    "no supported methods remain",
    "administratively prohibited",
    "no route to host",
    "connection timed out",
    "connection aborted",
    "unexpected packet",
    "run timed out",
    "run aborted",
    "eof",
    "no common algorithm",
    "process exited with status",
];

pub const UNKNOWN_ERROR: &str = "unknown error";

/// Bucket an error message: the first vocabulary entry it contains, or the
/// unknown bucket.
pub fn classify(message: &str) -> &'static str {
    let lowered = message.to_lowercase();
    for entry in ERROR_VOCABULARY {
        if lowered.contains(entry) {
            return entry;
        }
    }
    UNKNOWN_ERROR
}

#[derive(Default)]
struct ErrorTally {
    counts: HashMap<&'static str, usize>,
    hosts: HashMap<&'static str, Vec<String>>,
}

impl ErrorTally {
    fn record(&mut self, bucket: &'static str, host: &str) {
        *self.counts.entry(bucket).or_insert(0) += 1;
        self.hosts.entry(bucket).or_default().push(host.to_string());
    }

    fn print(&self, verbose: bool) {
        // Biggest buckets first.
        let mut entries: Vec<_> = self.counts.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (bucket, count) in entries {
            let _ = output::synchronized_println(&format!("\t\t{bucket}({count})"));
            if verbose {
                if let Some(hosts) = self.hosts.get(bucket) {
                    for host in hosts {
                        let _ = output::synchronized_println(&format!("\t\t\t{host}"));
                    }
                }
            }
        }
    }
}

/// Print the end-of-run report: connect/run failure counts per error
/// bucket, password-fallback hosts, and the timing extremes.
pub async fn print_summary(env: &Env, verbose: bool) {
    let mut connect_errors = ErrorTally::default();
    let mut run_errors = ErrorTally::default();
    let mut requires_pw_hosts: Vec<String> = Vec::new();

    let keys = env.state.get_host_keys().await;
    let num_entries = keys.len();
    let mut connected_ok = 0usize;
    let mut run_ok = 0usize;
    let mut run_once = 0usize;
    let mut total_connect = Duration::ZERO;
    let mut total_run = Duration::ZERO;
    let mut fastest_con: Option<(Duration, String)> = None;
    let mut slowest_con: Option<(Duration, String)> = None;
    let mut fastest_run: Option<(Duration, String)> = None;
    let mut slowest_run: Option<(Duration, String)> = None;

    for hostname in keys {
        let hi = match env.state.get_host_info(&hostname).await {
            Ok(hi) => hi,
            Err(_) => continue,
        };
        if hi.run_ok {
            run_ok += 1;
        }
        if hi.run_once {
            run_once += 1;
        }
        if hi.run_ok && hi.run_once {
            total_run += hi.run_time;
            if fastest_run.as_ref().is_none_or(|(t, _)| hi.run_time < *t) {
                fastest_run = Some((hi.run_time, hostname.clone()));
            }
            if slowest_run.as_ref().is_none_or(|(t, _)| hi.run_time > *t) {
                slowest_run = Some((hi.run_time, hostname.clone()));
            }
        }
        if hi.connected_ok {
            connected_ok += 1;
            total_connect += hi.connect_time;
            if fastest_con.as_ref().is_none_or(|(t, _)| hi.connect_time < *t) {
                fastest_con = Some((hi.connect_time, hostname.clone()));
            }
            if slowest_con.as_ref().is_none_or(|(t, _)| hi.connect_time > *t) {
                slowest_con = Some((hi.connect_time, hostname.clone()));
            }
            if hi.requires_pw {
                requires_pw_hosts.push(hostname.clone());
            }
        }
        if let Some(message) = &hi.last_error {
            let bucket = classify(message);
            // A host that never connected failed connecting; one that
            // connected but carries an error failed running.
            if !hi.connected_ok {
                connect_errors.record(bucket, &hostname);
            } else {
                run_errors.record(bucket, &hostname);
            }
        }
    }

    let connect_fail = num_entries - connected_ok;
    let run_fail = run_once.saturating_sub(run_ok);

    if connected_ok > 0 {
        let avg = total_connect / connected_ok as u32;
        let _ = output::synchronized_println(&format!(
            "Connect: {connected_ok} ok, avg {:05.2}s ({num_entries} targets)",
            avg.as_secs_f64()
        ));
    }
    if run_ok > 0 {
        let avg = total_run / run_ok as u32;
        let _ = output::synchronized_println(&format!(
            "Run:     {run_ok} ok, avg {:05.2}s ({run_once} attempted)",
            avg.as_secs_f64()
        ));
    }

    let _ = output::synchronized_println(&format!("\n\t{connect_fail} connection failures"));
    connect_errors.print(verbose);
    if env.cfg.password {
        let _ = output::synchronized_println(&format!(
            "\trequired a password({})",
            requires_pw_hosts.len()
        ));
        if verbose {
            for host in &requires_pw_hosts {
                let _ = output::synchronized_println(&format!("\t\t{host}"));
            }
        }
    }
    if run_once > 0 {
        let _ = output::synchronized_println(&format!("\t{run_fail} run failures"));
    }
    run_errors.print(verbose);
    let _ = output::synchronized_println("");

    if let (Some((fast, fast_host)), Some((slow, slow_host))) = (fastest_con, slowest_con) {
        let _ = output::synchronized_println(&format!(
            "Fastest Con: {:05.5}s - {fast_host}",
            fast.as_secs_f64()
        ));
        let _ = output::synchronized_println(&format!(
            "Slowest Con: {:05.5}s - {slow_host}\n",
            slow.as_secs_f64()
        ));
    }
    if let (Some((fast, fast_host)), Some((slow, slow_host))) = (fastest_run, slowest_run) {
        let _ = output::synchronized_println(&format!(
            "Fastest Run: {:05.5}s - {fast_host}",
            fast.as_secs_f64()
        ));
        let _ = output::synchronized_println(&format!(
            "Slowest Run: {:05.5}s - {slow_host}\n",
            slow.as_secs_f64()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_buckets() {
        assert_eq!(
            classify("dial tcp 10.0.0.1:22: Connection refused"),
            "connection refused"
        );
        assert_eq!(classify("Remote connection timed out"), "connection timed out");
        assert_eq!(classify("Remote connection aborted"), "connection aborted");
        assert_eq!(classify("Remote run timed out"), "run timed out");
        assert_eq!(classify("Remote run aborted"), "run aborted");
        assert_eq!(
            classify("web-01: no supported methods remain"),
            "no supported methods remain"
        );
        assert_eq!(classify("process exited with status 2"), "process exited with status");
    }

    #[test]
    fn test_classify_is_case_insensitive() {
        assert_eq!(classify("EOF"), "eof");
        assert_eq!(classify("No Route To Host"), "no route to host");
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify("the dog ate my packet"), UNKNOWN_ERROR);
        assert_eq!(classify(""), UNKNOWN_ERROR);
    }
}
