//! CLI parsing and the immutable [`ServerConfig`] derived from it (§4.5, §4.5A).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::error::ConfigError;

/// Bridges a web socket to a PTY-hosted child process.
#[derive(Debug, Parser)]
#[command(name = "wsty", version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on.
    #[arg(short = 'i', long, default_value = "0.0.0.0")]
    pub interface: IpAddr,

    /// Port to listen on.
    #[arg(short = 'p', long, default_value_t = 7681)]
    pub port: u16,

    /// Web socket path clients must connect to.
    #[arg(long, default_value = "/ws")]
    pub ws_path: String,

    /// Require clients to present this credential via JSON_DATA before a
    /// PTY is spawned. Mutually exclusive with `--credential-file`.
    #[arg(short = 'c', long)]
    pub credential: Option<String>,

    /// Read the required credential from a file instead of the command
    /// line (avoids leaking it via `ps`).
    #[arg(long, conflicts_with = "credential")]
    pub credential_file: Option<PathBuf>,

    /// Accept only one client at a time; exit once it disconnects.
    #[arg(short = 'o', long)]
    pub once: bool,

    /// Refuse new connections once this many clients are active (0 = unlimited).
    #[arg(short = 'm', long, default_value_t = 0)]
    pub max_clients: u32,

    /// Do not write client INPUT to the PTY; RESIZE still applies.
    #[arg(short = 'R', long)]
    pub readonly: bool,

    /// Verify the `Origin` header matches `Host` before upgrading.
    #[arg(long)]
    pub check_origin: bool,

    /// Reconnect hint (seconds) sent to the client in SET_RECONNECT.
    #[arg(long, default_value_t = 10)]
    pub reconnect: u32,

    /// Raw JSON object sent to the client in SET_PREFERENCES.
    #[arg(long, default_value = "{}")]
    pub prefs_json: String,

    /// Signal sent to the child on teardown.
    #[arg(long, default_value = "SIGHUP")]
    pub sig_name: String,

    /// Increase log verbosity (-v, -vv, -vvv). Overridden by `RUST_LOG` if set.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Command (and arguments) to run inside the PTY, e.g. `-- bash -l`.
    #[arg(required = true, last = true)]
    pub argv: Vec<String>,
}

/// Immutable, process-wide policy consulted by every other component
/// (§4.5). Built once from [`Cli`] and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub ws_path: String,
    pub argv: Vec<String>,
    pub credential: Option<String>,
    pub sig_name: String,
    pub sig_code: nix::sys::signal::Signal,
    pub reconnect: u32,
    pub prefs_json: String,
    pub check_origin: bool,
    pub readonly: bool,
    pub once: bool,
    pub max_clients: u32,
    /// This machine's hostname, read once at startup via `gethostname(3)`.
    /// Used in `SET_WINDOW_TITLE` (§4.2) — the title names the host the
    /// server itself runs on, not the connecting client's address.
    pub hostname: String,
}

impl ServerConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.argv.is_empty() {
            return Err(ConfigError::MissingCommand);
        }

        let credential = match cli.credential_file {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| {
                    ConfigError::CredentialFileUnreadable {
                        path: path.clone(),
                        source,
                    }
                })?;
                Some(raw.trim().to_string())
            }
            None => cli.credential,
        };

        let sig_code = parse_signal(&cli.sig_name).unwrap_or(nix::sys::signal::Signal::SIGHUP);

        Ok(ServerConfig {
            listen_addr: SocketAddr::new(cli.interface, cli.port),
            ws_path: cli.ws_path,
            argv: cli.argv,
            credential,
            sig_name: cli.sig_name,
            sig_code,
            reconnect: cli.reconnect,
            prefs_json: cli.prefs_json,
            check_origin: cli.check_origin,
            readonly: cli.readonly,
            once: cli.once,
            max_clients: cli.max_clients,
            hostname: local_hostname(),
        })
    }

    pub fn command_name(&self) -> &str {
        self.argv[0].as_str()
    }
}

/// `gethostname(3)` via `libc`, matching the original server's direct call —
/// falls back to `"localhost"` on the (essentially never-hit) error path
/// rather than failing startup over a cosmetic value.
fn local_hostname() -> String {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl Default for ServerConfig {
    /// A permissive default used by tests that only need a config shape,
    /// not real CLI parsing.
    fn default() -> Self {
        ServerConfig {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 7681),
            ws_path: "/ws".to_string(),
            argv: vec!["cat".to_string()],
            credential: None,
            sig_name: "SIGHUP".to_string(),
            sig_code: nix::sys::signal::Signal::SIGHUP,
            reconnect: 10,
            prefs_json: "{}".to_string(),
            check_origin: false,
            readonly: false,
            once: false,
            max_clients: 0,
            hostname: "localhost".to_string(),
        }
    }
}

fn parse_signal(name: &str) -> Option<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal::*;
    let upper = name.trim_start_matches("SIG").to_uppercase();
    Some(match upper.as_str() {
        "HUP" => SIGHUP,
        "INT" => SIGINT,
        "TERM" => SIGTERM,
        "KILL" => SIGKILL,
        "QUIT" => SIGQUIT,
        "USR1" => SIGUSR1,
        "USR2" => SIGUSR2,
        _ => return None,
    })
}

/// Log verbosity derived from `-v` counting, used only when `RUST_LOG` is unset.
pub fn verbosity_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_command() {
        let cli = Cli {
            interface: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 7681,
            ws_path: "/ws".into(),
            credential: None,
            credential_file: None,
            once: false,
            max_clients: 0,
            readonly: false,
            check_origin: false,
            reconnect: 10,
            prefs_json: "{}".into(),
            sig_name: "SIGHUP".into(),
            verbose: 0,
            argv: vec![],
        };
        assert!(matches!(
            ServerConfig::from_cli(cli),
            Err(ConfigError::MissingCommand)
        ));
    }

    #[test]
    fn unknown_signal_name_falls_back_to_sighup() {
        assert_eq!(parse_signal("SIGBOGUS"), None);
    }

    #[test]
    fn parses_known_signal_names() {
        assert_eq!(parse_signal("SIGTERM"), Some(nix::sys::signal::Signal::SIGTERM));
        assert_eq!(parse_signal("HUP"), Some(nix::sys::signal::Signal::SIGHUP));
    }
}
