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

//! The serialized output sink. Results from many hosts land concurrently;
//! funneling every write through one mutex per stream keeps the blocks
//! from interleaving mid-line.

use once_cell::sync::Lazy;
use std::io::{self, Write};
use std::sync::Mutex;

static STDOUT_MUTEX: Lazy<Mutex<io::Stdout>> = Lazy::new(|| Mutex::new(io::stdout()));
static STDERR_MUTEX: Lazy<Mutex<io::Stderr>> = Lazy::new(|| Mutex::new(io::stderr()));

/// Write one line to stdout atomically.
pub fn synchronized_println(text: &str) -> io::Result<()> {
    let mut stdout = STDOUT_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    writeln!(stdout, "{text}")?;
    stdout.flush()
}

/// Write one line to stderr atomically.
pub fn synchronized_eprintln(text: &str) -> io::Result<()> {
    let mut stderr = STDERR_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    writeln!(stderr, "{text}")?;
    stderr.flush()
}

/// Tee a raw chunk of remote stdout to ours, atomically.
pub fn write_stdout_raw(data: &[u8]) {
    let mut stdout = STDOUT_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let _ = stdout.write_all(data);
    let _ = stdout.flush();
}

/// Tee a raw chunk of remote stderr to ours, atomically.
pub fn write_stderr_raw(data: &[u8]) {
    let mut stderr = STDERR_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let _ = stderr.write_all(data);
    let _ = stderr.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synchronized_output() {
        // Just exercise the lock paths; interleaving behavior is covered
        // by the concurrent run tests.
        let _ = synchronized_println("out");
        let _ = synchronized_eprintln("err");
        write_stdout_raw(b"raw out\n");
        write_stderr_raw(b"raw err\n");
    }
}
