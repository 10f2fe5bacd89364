//! Command-line surface: `-p <port> -d <Y|y> -l <0-5> -h`.
//!
//! Parsing follows getopt conventions: an option value may be attached
//! (`-p1080`) or given as the next argument (`-p 1080`), and unknown options
//! are reported without stopping the parse.

use crate::error::{Error, Result};
use crate::server::config::{ServerConfig, DEFAULT_PORT};

/// Highest accepted `-l` value.
pub const MAX_LOG_LEVEL: u8 = 5;

/// Parsed command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOptions {
    /// `-p`: listen port
    pub port: Option<u16>,
    /// `-d Y`: detach from the terminal
    pub detach: bool,
    /// `-l`: log verbosity, 0 (off) to 5 (trace)
    pub log_level: Option<u8>,
    /// `-h`: print usage and exit
    pub help: bool,
    /// Warnings for unknown options or missing values
    pub diagnostics: Vec<String>,
}

impl CliOptions {
    /// Parse arguments, excluding the program name.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut options = CliOptions::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            if arg == "--" {
                break;
            }
            let Some(flags) = arg.strip_prefix('-').filter(|f| !f.is_empty()) else {
                options.diagnostics.push(format!("ignoring argument '{}'.", arg));
                continue;
            };

            for (i, flag) in flags.char_indices() {
                match flag {
                    'h' => {
                        options.help = true;
                        return Ok(options);
                    }
                    'd' | 'p' | 'l' => {
                        let attached = &flags[i + flag.len_utf8()..];
                        let value = if attached.is_empty() {
                            args.next()
                        } else {
                            Some(attached.to_string())
                        };

                        match value {
                            Some(value) => options.apply(flag, &value)?,
                            None => options
                                .diagnostics
                                .push(format!("missing argument for '-{}'.", flag)),
                        }
                        // The value consumed the rest of this argument.
                        break;
                    }
                    other => options
                        .diagnostics
                        .push(format!("unknown option '-{}'.", other)),
                }
            }
        }

        Ok(options)
    }

    fn apply(&mut self, flag: char, value: &str) -> Result<()> {
        match flag {
            'd' => {
                if value == "Y" || value == "y" {
                    self.detach = true;
                }
            }
            'p' => {
                let port = value
                    .parse::<u16>()
                    .map_err(|_| Error::config(format!("invalid port [{}]", value)))?;
                self.port = Some(port);
            }
            'l' => match value.parse::<u8>() {
                Ok(level) if level <= MAX_LOG_LEVEL => self.log_level = Some(level),
                _ => {
                    return Err(Error::config(format!(
                        "debug level [{}] out of range [0 - {}]",
                        value, MAX_LOG_LEVEL
                    )))
                }
            },
            _ => unreachable!("only value-taking flags are applied"),
        }
        Ok(())
    }

    /// Server configuration for these options.
    pub fn to_config(&self) -> ServerConfig {
        ServerConfig::new(self.port.unwrap_or(DEFAULT_PORT))
    }
}

/// `tracing` filter directive for a `-l` level.
pub fn log_filter(level: u8) -> &'static str {
    match level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    }
}

/// Usage text printed for `-h`.
pub fn usage() -> String {
    format!(
        r#"Usage: socks5-relay [options]
Options:
    -p <port>       tcp listen port (default {})
    -d <Y|y>        run as a daemon if 'Y' or 'y', otherwise not
    -l <level>      debug log level, range [0, {}]
    -h              print help information
"#,
        DEFAULT_PORT, MAX_LOG_LEVEL
    )
}
