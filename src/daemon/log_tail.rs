use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Return the last `n` lines of a log file (or all if it has fewer).
///
/// Missing or unreadable files yield an empty tail. Invalid UTF-8 is
/// replaced rather than rejected.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    if n == 0 {
        return Vec::new();
    }

    let mut window = VecDeque::with_capacity(n);
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if window.len() == n {
                    window.pop_front();
                }
                window.push_back(line);
            }
        }
    }
    window.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(lines: usize) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let body: String = (0..lines).map(|i| format!("line {i}\n")).collect();
        std::fs::write(file.path(), body).unwrap();
        file
    }

    #[test]
    fn tail_returns_last_n_lines() {
        let log = log_with(10);
        assert_eq!(tail_lines(log.path(), 3), vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn short_file_returns_everything() {
        let log = log_with(2);
        assert_eq!(tail_lines(log.path(), 20), vec!["line 0", "line 1"]);
    }

    #[test]
    fn missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tail_lines(&dir.path().join("absent.log"), 10).is_empty());
    }

    #[test]
    fn binary_garbage_is_tolerated() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"ok\n\xff\xfe broken\nlast").unwrap();
        let tail = tail_lines(file.path(), 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1], "last");
    }
}
