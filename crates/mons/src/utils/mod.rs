use crate::errors::CliError;
use camino::Utf8Path;
use miette::Result;

pub mod config;

#[macro_export]
macro_rules! println_pad {
    ($($arg:tt)*) => {{
        let __s = format!($($arg)*);
        for __line in __s.lines() {
            println!("    {}", __line);
        }
    }};
}

/// Overlay roots are recorded in manifests and mount tables, so they must be absolute.
pub fn require_absolute(path: &str) -> Result<&Utf8Path> {
    let path = Utf8Path::new(path);
    if !path.is_absolute() {
        return Err(CliError::not_absolute(path).into());
    }
    Ok(path)
}
