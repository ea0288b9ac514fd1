//! Durable vote persistence.
//!
//! A granted vote is serialized into a temporary file, synced and renamed
//! over the live file, so a crash-restart always observes a vote whose term
//! is at least the last stored one.

use crate::raft::pb::VoteRpc;
use prost::Message;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

pub struct VoteKeeper {
    path: PathBuf,
}

impl VoteKeeper {
    pub fn new(path: PathBuf) -> Self {
        VoteKeeper { path }
    }

    /// Persist a vote atomically.
    pub fn store(&self, vote: &VoteRpc) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            let payload = vote.encode_to_vec();
            file.write_all(&(payload.len() as u64).to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)
    }

    /// Read back the last stored vote, if any.
    pub fn recover(&self) -> io::Result<Option<VoteRpc>> {
        let mut file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut len_raw = [0u8; 8];
        file.read_exact(&mut len_raw)?;
        let mut payload = vec![0u8; u64::from_le_bytes(len_raw) as usize];
        file.read_exact(&mut payload)?;
        let vote = VoteRpc::decode(payload.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(vote))
    }
}
