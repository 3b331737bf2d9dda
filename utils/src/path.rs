use std::fmt::Display;

use camino::Utf8Path;

/// Formats a backend or archive path for log and error messages.
///
/// Paths made only of "safe" characters print as-is; anything else is
/// quoted the way a POSIX shell would parse it back.
#[derive(Debug, Clone, Copy)]
pub struct PathQuotedDisplay<'a> {
    path: &'a Utf8Path,
}

impl Display for PathQuotedDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.path.as_str();
        if s
            .chars()
            .all(|c| matches!(c, '/' | '.' | '-' | '_') || c.is_alphanumeric())
        {
            return f.write_str(s);
        }
        match shlex::try_quote(s) {
            Ok(quoted) => f.write_str(&quoted),
            // Only fails on interior NUL, which a UTF-8 path can still carry
            Err(_) => write!(f, "{s:?}"),
        }
    }
}

impl<'a> PathQuotedDisplay<'a> {
    /// Wrap a path for display.
    pub fn new<P: AsRef<Utf8Path> + ?Sized>(path: &'a P) -> PathQuotedDisplay<'a> {
        PathQuotedDisplay {
            path: path.as_ref(),
        }
    }
}
