use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use serde::Serialize;

/// Snapshot of a job log: the requested lines plus the total line count.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobLog {
    pub lines: Vec<String>,
    pub total_lines: usize,
}

/// Reads a snapshot of `path`, keeping at most the last `tail` lines (`0` keeps all).
///
/// Invalid UTF-8 is replaced rather than rejected; the log is produced by
/// arbitrary external processes.
pub fn read_log_tail(path: &Path, tail: usize) -> io::Result<JobLog> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut window = VecDeque::new();
    let mut total_lines = 0usize;
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let bytes = reader.read_until(b'\n', &mut buffer)?;
        if bytes == 0 {
            break;
        }
        while matches!(buffer.last(), Some(b'\n' | b'\r')) {
            buffer.pop();
        }
        total_lines += 1;
        window.push_back(String::from_utf8_lossy(&buffer).into_owned());
        if tail > 0 && window.len() > tail {
            window.pop_front();
        }
    }
    Ok(JobLog {
        lines: window.into(),
        total_lines,
    })
}
