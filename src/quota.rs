//! Byte ceilings for single files and for whole transactions.

use crate::error::UploadError;

/// Which configured limit a ceiling derives from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitKind {
    File,
    Transaction,
}

/// The effective byte bound for the next file; `None` is unlimited.
#[derive(Clone, Copy, Debug)]
pub struct Ceiling {
    pub limit: Option<u64>,
    pub kind: LimitKind,
}

impl Ceiling {
    /// True once `written` has crossed the bound.
    pub fn exceeded_by(&self, written: u64) -> bool {
        self.limit.is_some_and(|limit| written > limit)
    }

    /// The 413 flavor matching the binding limit.
    pub fn to_error(&self) -> UploadError {
        match self.kind {
            LimitKind::File => UploadError::FileTooLarge,
            LimitKind::Transaction => UploadError::TransactionTooLarge,
        }
    }

    /// Pre-flight check against an advertised `Content-Length`.
    pub fn check_advertised(&self, advertised: Option<u64>) -> Result<(), UploadError> {
        match advertised {
            Some(length) if self.exceeded_by(length) => Err(self.to_error()),
            _ => Ok(()),
        }
    }
}

/// Tracks bytes spent across the files of one request.
#[derive(Debug)]
pub struct TransactionMeter {
    max_filesize: u64,
    max_transaction_size: u64,
    spent: u64,
}

impl TransactionMeter {
    /// Both limits read as 0 meaning unlimited.
    pub fn new(max_filesize: u64, max_transaction_size: u64) -> Self {
        Self { max_filesize, max_transaction_size, spent: 0 }
    }

    /// The effective ceiling for the next file: the lesser of the per-file
    /// limit and what remains of the transaction. On a tie the per-file
    /// limit is reported as binding.
    pub fn ceiling(&self) -> Ceiling {
        let file = (self.max_filesize > 0).then_some(self.max_filesize);
        let transaction = (self.max_transaction_size > 0)
            .then(|| self.max_transaction_size.saturating_sub(self.spent));

        match (file, transaction) {
            (None, None) => Ceiling { limit: None, kind: LimitKind::File },
            (Some(limit), None) => Ceiling { limit: Some(limit), kind: LimitKind::File },
            (None, Some(limit)) => Ceiling { limit: Some(limit), kind: LimitKind::Transaction },
            (Some(per_file), Some(remaining)) if per_file <= remaining => {
                Ceiling { limit: Some(per_file), kind: LimitKind::File }
            }
            (Some(_), Some(remaining)) => {
                Ceiling { limit: Some(remaining), kind: LimitKind::Transaction }
            }
        }
    }

    /// Accounts a persisted file's bytes against the transaction.
    pub fn consume(&mut self, written: u64) {
        self.spent = self.spent.saturating_add(written);
    }

    pub fn spent(&self) -> u64 {
        self.spent
    }
}
