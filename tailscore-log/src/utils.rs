use std::error::Error;
use std::fmt;

/// Reports an error through the logger, or on `stderr` while no subscriber accepts errors.
///
/// Only meant for startup failures that can happen before `init` completes. Everywhere
/// else use [`error!`](crate::error).
///
/// # Example
///
/// ```
/// let error: Box<dyn std::error::Error> = "failed to bind socket".into();
/// tailscore_log::ensure_error(&error);
/// ```
pub fn ensure_error<E: AsRef<dyn Error>>(error: E) {
    if tracing::event_enabled!(tracing::Level::ERROR) {
        crate::error!("{}", LogError(error.as_ref()));
    } else {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("error: {}", LogError(error.as_ref()));
        }
    }
}

/// Displays an error followed by one `caused by:` line per source.
///
/// # Example
///
/// ```
/// use tailscore_log::LogError;
///
/// if let Err(error) = std::env::var("TAILSCORE_CONFIG") {
///     tailscore_log::warn!("no config path in environment: {}", LogError(&error));
/// }
/// ```
pub struct LogError<'a, E: Error + ?Sized>(pub &'a E);

impl<E: Error + ?Sized> fmt::Display for LogError<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(s) = source {
            write!(f, "\n  caused by: {s}")?;
            source = s.source();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[derive(Debug)]
    struct Outer(io::Error);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("could not load config")
        }
    }

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_log_error_prints_causes() {
        let error = Outer(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        assert_eq!(
            LogError(&error).to_string(),
            "could not load config\n  caused by: no such file"
        );
    }
}
