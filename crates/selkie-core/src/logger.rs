//! Error-logger sink
//!
//! Runtime code reports unrecoverable and noteworthy errors through a plain
//! sink with one operation so embedders can route them anywhere. The
//! default sink writes
//! `[YYYY-MM-DD HH:MM:SS.mmm TID:<id>] <message> (<file>:<line>)`
//! to standard error.

use crate::thread_id::current_thread_id;
use std::sync::Arc;

/// Sink for runtime error messages
pub trait ErrorLogger: Send + Sync {
    /// Log one message with its call site
    fn log(&self, file: &str, line: u32, message: &str);
}

/// Default sink writing to standard error
#[derive(Debug, Default)]
pub struct StderrLogger;

impl ErrorLogger for StderrLogger {
    fn log(&self, file: &str, line: u32, message: &str) {
        let now = chrono::Local::now();
        eprintln!(
            "[{} TID:{}] {} ({}:{})",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            current_thread_id(),
            message,
            file,
            line
        );
    }
}

/// Create the default stderr logger
pub fn stderr_logger() -> Arc<dyn ErrorLogger> {
    Arc::new(StderrLogger)
}

/// Log through an [`ErrorLogger`], capturing the call site
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log(file!(), line!(), &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingLogger {
        lines: Mutex<Vec<(String, u32, String)>>,
    }

    impl ErrorLogger for CollectingLogger {
        fn log(&self, file: &str, line: u32, message: &str) {
            self.lines
                .lock()
                .unwrap()
                .push((file.to_string(), line, message.to_string()));
        }
    }

    #[test]
    fn test_macro_captures_call_site() {
        let logger = CollectingLogger::default();
        log_error!(logger, "boom: {}", 7);
        let lines = logger.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].0.ends_with("logger.rs"));
        assert_eq!(lines[0].2, "boom: 7");
    }

    #[test]
    fn test_stderr_logger_does_not_panic() {
        StderrLogger.log("x.rs", 1, "message");
    }
}
