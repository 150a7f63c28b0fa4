//! Error-chain formatting for operator-facing log lines.
//!
//! The scheduler's library errors are typed enums; by the time one
//! reaches a log line or an emergency shutdown message it has usually
//! been wrapped a few times. These helpers flatten the `source()` chain
//! into something a person reading `flowd.log` can act on.

use std::error::Error as StdError;

/// Render an error and its sources as an indented chain, outermost
/// first.
pub fn format_error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    let mut depth = 1;
    while let Some(cause) = source {
        out.push_str(&format!("\n{:indent$}caused by: {cause}", "", indent = depth * 2));
        source = cause.source();
        depth += 1;
    }
    out
}

/// The innermost error in the chain.
pub fn root_cause<'a>(error: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    let mut current = error;
    while let Some(source) = current.source() {
        current = source;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Wrapped {
        message: &'static str,
        inner: Option<Box<Wrapped>>,
    }

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.message)
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            self.inner.as_deref().map(|e| e as &(dyn StdError + 'static))
        }
    }

    fn chain() -> Wrapped {
        Wrapped {
            message: "submission failed",
            inner: Some(Box::new(Wrapped {
                message: "host unreachable",
                inner: Some(Box::new(Wrapped { message: "connection refused", inner: None })),
            })),
        }
    }

    #[test]
    fn chain_renders_every_cause() {
        let formatted = format_error_chain(&chain());
        assert!(formatted.starts_with("submission failed"));
        assert!(formatted.contains("caused by: host unreachable"));
        assert!(formatted.contains("caused by: connection refused"));
    }

    #[test]
    fn root_cause_is_the_innermost_error() {
        let error = chain();
        assert_eq!(root_cause(&error).to_string(), "connection refused");
    }
}
