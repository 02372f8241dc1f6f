//! Compact binary encoding of a miner's checkpoint submission.
//!
//! Layout: one length byte followed by the UTF-8 repository name, then three
//! big-endian `u32`s holding the `f32` bits of the reported average generation
//! time, the submission format version and the contest identifier.

use serde::{Deserialize, Serialize};

/// Largest encoded submission the ledger commitment can hold.
pub const MAX_SUBMISSION_BYTES: usize = 128;

/// Format version written by this build.
pub const SUBMISSION_SPEC_VERSION: u32 = 0;

pub type ContestId = u32;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SubmissionCodecError {
    #[error("submission encodes to {0} bytes, limit is {MAX_SUBMISSION_BYTES}")]
    TooLarge(usize),
    #[error("repository name is {0} bytes, limit is 255")]
    RepositoryTooLong(usize),
    #[error("submission truncated at byte {0}")]
    Truncated(usize),
    #[error("{0} trailing bytes after submission")]
    TrailingBytes(usize),
    #[error("repository name is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSubmission {
    pub repository: String,
    /// Average generation time in seconds the miner claims for its checkpoint.
    pub average_time: f32,
    pub spec_version: u32,
    pub contest: ContestId,
}

impl CheckpointSubmission {
    pub fn new<S: Into<String>>(repository: S, average_time: f32, contest: ContestId) -> Self {
        Self {
            repository: repository.into(),
            average_time,
            spec_version: SUBMISSION_SPEC_VERSION,
            contest,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SubmissionCodecError> {
        let repository = self.repository.as_bytes();
        if repository.len() > u8::MAX as usize {
            return Err(SubmissionCodecError::RepositoryTooLong(repository.len()));
        }

        let mut out = Vec::with_capacity(1 + repository.len() + 12);
        out.push(repository.len() as u8);
        out.extend_from_slice(repository);
        out.extend_from_slice(&self.average_time.to_bits().to_be_bytes());
        out.extend_from_slice(&self.spec_version.to_be_bytes());
        out.extend_from_slice(&self.contest.to_be_bytes());

        if out.len() > MAX_SUBMISSION_BYTES {
            return Err(SubmissionCodecError::TooLarge(out.len()));
        }
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SubmissionCodecError> {
        let mut reader = Reader { data, position: 0 };

        let length = reader.take(1)?[0] as usize;
        let repository = std::str::from_utf8(reader.take(length)?)
            .map_err(|_| SubmissionCodecError::InvalidUtf8)?
            .to_string();
        let average_time = f32::from_bits(reader.read_u32()?);
        let spec_version = reader.read_u32()?;
        let contest = reader.read_u32()?;

        let trailing = data.len() - reader.position;
        if trailing > 0 {
            return Err(SubmissionCodecError::TrailingBytes(trailing));
        }

        Ok(Self {
            repository,
            average_time,
            spec_version,
            contest,
        })
    }

    /// Hex form of the encoding, as published in the ledger commitment.
    pub fn to_hex(&self) -> Result<String, SubmissionCodecError> {
        Ok(hex::encode(self.to_bytes()?))
    }

    /// Whether this submission targets `contest` under the current format and
    /// is not simply the contest baseline.
    pub fn is_eligible(&self, contest: ContestId, baseline_repository: &str) -> bool {
        self.spec_version == SUBMISSION_SPEC_VERSION
            && self.contest == contest
            && self.repository != baseline_repository
    }
}

struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], SubmissionCodecError> {
        let end = self.position + len;
        let slice = self
            .data
            .get(self.position..end)
            .ok_or(SubmissionCodecError::Truncated(self.position))?;
        self.position = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, SubmissionCodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
