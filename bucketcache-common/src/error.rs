//  Copyright 2025 bucketcache Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
};

/// ErrorKind is all kinds of Error of bucketcache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The bucket the key routes to is not owned by this node.
    ///
    /// The only retryable kind. The caller is expected to retry against the current owner.
    BucketNotOwned,
    /// Add on a key that already exists.
    KeyExists,
    /// The entry is locked by another lock holder.
    ItemLocked,
    /// The expected version does not match the stored version.
    VersionMismatch,
    /// The write would move an existing entry to another data group.
    IncompatibleGroup,
    /// Capacity exhausted and eviction could not free enough space.
    NotEnoughSpace,
    /// Config error.
    Config,
    /// An internal invariant has been violated.
    Invariant,
    /// The cache has been disposed.
    Closed,
    /// External error.
    External,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }

    /// Whether the operation may succeed when retried against another node.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::BucketNotOwned)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::BucketNotOwned => "Bucket not owned",
            ErrorKind::KeyExists => "Key exists",
            ErrorKind::ItemLocked => "Item locked",
            ErrorKind::VersionMismatch => "Version mismatch",
            ErrorKind::IncompatibleGroup => "Incompatible group",
            ErrorKind::NotEnoughSpace => "Not enough space",
            ErrorKind::Config => "Config error",
            ErrorKind::Invariant => "Invariant violated",
            ErrorKind::Closed => "Closed",
            ErrorKind::External => "External error",
        }
    }
}

/// Error is the error struct returned by all bucketcache functions.
///
/// ## Display
///
/// Via `Display`, the error is printed in a single line:
///
/// ```shell
/// Bucket not owned, context: { bucket: 5 } => I am no more the owner of this bucket
/// ```
///
/// Via `Debug`, the error is printed in multi lines with context, source and backtrace (if captured).
///
/// Via `{:#?}`, the conventional struct-style Debug representation is used.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // If alternate has been specified, we will print like Debug.
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {k}: {v}")?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            let mut iter = self.context.iter().peekable();
            while let Some((k, v)) = iter.next() {
                write!(f, "{k}: {v}")?;
                if iter.peek().is_some() {
                    write!(f, ", ")?;
                }
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// If the error needs to carry a source error, please use `with_source` method.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
            backtrace: Some(Arc::new(Backtrace::capture())),
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    ///
    /// # Notes
    ///
    /// If the source has been set, we will raise a panic here.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &Vec<(&'static str, String)> {
        &self.context
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }

    /// Whether the operation may succeed when retried against another node.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Result type for bucketcache.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating a [`ErrorKind::BucketNotOwned`] error with context.
    pub fn bucket_not_owned(bucket: u32) -> Self {
        Error::new(ErrorKind::BucketNotOwned, "I am no more the owner of this bucket").with_context("bucket", bucket)
    }

    /// Helper for creating a [`ErrorKind::KeyExists`] error.
    pub fn key_exists() -> Self {
        Error::new(ErrorKind::KeyExists, "the specified key already exists")
    }

    /// Helper for creating a [`ErrorKind::ItemLocked`] error.
    pub fn item_locked() -> Self {
        Error::new(ErrorKind::ItemLocked, "item is locked")
    }

    /// Helper for creating a [`ErrorKind::VersionMismatch`] error with context.
    pub fn version_mismatch(expected: u64, actual: u64) -> Self {
        Error::new(ErrorKind::VersionMismatch, "item version does not match")
            .with_context("expected", expected)
            .with_context("actual", actual)
    }

    /// Helper for creating a [`ErrorKind::IncompatibleGroup`] error.
    pub fn incompatible_group() -> Self {
        Error::new(
            ErrorKind::IncompatibleGroup,
            "data group of the inserted item does not match the existing item's data group",
        )
    }

    /// Helper for creating a [`ErrorKind::NotEnoughSpace`] error with context.
    pub fn not_enough_space(capacity: usize, used: usize, required: usize) -> Self {
        Error::new(ErrorKind::NotEnoughSpace, "the cache is full and not enough items could be evicted")
            .with_context("capacity", capacity)
            .with_context("used", used)
            .with_context("required", required)
    }

    /// Helper for creating an [`ErrorKind::Invariant`] error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Invariant, message)
    }

    /// Helper for creating a [`ErrorKind::Closed`] error.
    pub fn closed() -> Self {
        Error::new(ErrorKind::Closed, "the cache has been disposed")
    }

    /// Helper for creating a [`ErrorKind::Config`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Config, message)
    }
}
