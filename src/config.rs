use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ServerError;

/// Study room coordination server
#[derive(Parser, Debug, Clone)]
#[command(name = "study_room")]
#[command(version)]
pub struct Args {
    /// Address to bind the HTTP/WebSocket listener to
    #[arg(long, env = "STUDY_ROOM_BIND", default_value = "0.0.0.0:2052")]
    pub bind: String,

    /// Directory served as static files
    #[arg(long, env = "STUDY_ROOM_STATIC_DIR", default_value = "public")]
    pub static_dir: PathBuf,

    /// Path to TLS certificate (PEM format)
    #[arg(long, env = "STUDY_ROOM_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM format)
    #[arg(long, env = "STUDY_ROOM_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Default work phase length in minutes
    #[arg(long, env = "STUDY_ROOM_WORK_MINUTES", default_value_t = 25)]
    pub work_minutes: u32,

    /// Default break phase length in minutes
    #[arg(long, env = "STUDY_ROOM_BREAK_MINUTES", default_value_t = 5)]
    pub break_minutes: u32,

    /// Keep the timer running after a phase switch
    #[arg(long, env = "STUDY_ROOM_AUTO_CONTINUE", default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_continue: bool,

    /// Commands a room buffers before submitters have to wait
    #[arg(long, env = "STUDY_ROOM_INBOX_CAPACITY", default_value_t = 64)]
    pub inbox_capacity: usize,

    /// Chat messages kept in memory per room
    #[arg(long, env = "STUDY_ROOM_CHAT_RETENTION", default_value_t = 500)]
    pub chat_retention: usize,

    /// Chat messages included in a join snapshot
    #[arg(long, env = "STUDY_ROOM_HISTORY_LIMIT", default_value_t = 50)]
    pub history_limit: usize,

    /// Delay before a dropped connection counts as a leave, in milliseconds
    #[arg(long, env = "STUDY_ROOM_DISCONNECT_GRACE_MS", default_value_t = 2000)]
    pub disconnect_grace_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    pub work_minutes: u32,
    pub break_minutes: u32,
    pub auto_continue: bool,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        TimerDefaults {
            work_minutes: 25,
            break_minutes: 5,
            auto_continue: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub timer: TimerDefaults,
    pub inbox_capacity: usize,
    pub chat_retention: usize,
    pub history_limit: usize,
}

impl Default for RoomSettings {
    fn default() -> Self {
        RoomSettings {
            timer: TimerDefaults::default(),
            inbox_capacity: 64,
            chat_retention: 500,
            history_limit: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub static_dir: PathBuf,
    pub tls: Option<TlsPaths>,
    pub room: RoomSettings,
    pub disconnect_grace: Duration,
}

impl TryFrom<Args> for Config {
    type Error = ServerError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let bind = args
            .bind
            .parse()
            .map_err(|e| ServerError::Bind(format!("{}: {e}", args.bind)))?;

        let tls = match (args.tls_cert, args.tls_key) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => {
                return Err(ServerError::Tls(
                    "both --tls-cert and --tls-key are required".to_string(),
                ))
            }
        };

        Ok(Config {
            bind,
            static_dir: args.static_dir,
            tls,
            room: RoomSettings {
                timer: TimerDefaults {
                    work_minutes: args.work_minutes.clamp(1, crate::timer::MAX_PHASE_MINUTES),
                    break_minutes: args.break_minutes.clamp(1, crate::timer::MAX_PHASE_MINUTES),
                    auto_continue: args.auto_continue,
                },
                inbox_capacity: args.inbox_capacity.max(1),
                chat_retention: args.chat_retention.max(1),
                history_limit: args.history_limit,
            },
            disconnect_grace: Duration::from_millis(args.disconnect_grace_ms),
        })
    }
}
