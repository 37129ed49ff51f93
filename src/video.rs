use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::presence::UserRef;

/// Maps a room member onto the uid the media SDK knows them by, so clients
/// can label video tiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoIdentity {
    pub video_uid: u32,
    pub display_name: String,
}

impl VideoIdentity {
    pub fn of(user: &UserRef) -> Self {
        VideoIdentity {
            video_uid: video_uid(&user.user_id),
            display_name: user.display_name.clone(),
        }
    }
}

/// Stable across processes and restarts: the first four bytes of the
/// SHA-256 of the user id.
pub fn video_uid(user_id: &str) -> u32 {
    let digest = Sha256::digest(user_id.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
