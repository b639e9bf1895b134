//! Posting set resolver.
//!
//! Turns a transaction request, explicit postings or a script, into a
//! validated, ordered posting list plus the metadata mutations that go with
//! it. The result is a pure function of the input.

pub mod compiler;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tally_shared::types::Metadata;

use crate::error::LedgerError;
use crate::posting::{is_valid_address, Postings};

pub use compiler::{CompiledScript, CompilerRegistry, Runtime, Script, ScriptCompiler};

/// Where the postings of a transaction come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    /// Explicit postings.
    Postings(Postings),
    /// A script to compile.
    Script(Script),
}

/// Normalized transaction content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTransaction {
    /// Validated postings, at least one.
    pub postings: Postings,
    /// Caller and script metadata merged.
    pub metadata: Metadata,
    /// Account metadata set by the script.
    pub account_metadata: BTreeMap<String, Metadata>,
}

/// Resolves transaction sources through the registered compilers.
#[derive(Debug, Clone, Default)]
pub struct PostingSetResolver {
    compilers: CompilerRegistry,
}

impl PostingSetResolver {
    /// Creates a resolver over `compilers`.
    #[must_use]
    pub const fn new(compilers: CompilerRegistry) -> Self {
        Self { compilers }
    }

    /// Resolves `source` with caller `metadata`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NoPostings`] when nothing is moved
    /// - [`LedgerError::MetadataOverride`] when script and caller set the same key
    /// - [`LedgerError::Validation`] on malformed addresses or assets
    /// - compiler errors, passed through
    pub fn resolve(
        &self,
        source: &TransactionSource,
        metadata: &Metadata,
    ) -> Result<ResolvedTransaction, LedgerError> {
        let resolved = match source {
            TransactionSource::Postings(postings) => ResolvedTransaction {
                postings: postings.clone(),
                metadata: metadata.clone(),
                account_metadata: BTreeMap::new(),
            },
            TransactionSource::Script(script) => {
                let compiled = self.compilers.compile(script)?;
                let mut merged = compiled.metadata;
                for (key, value) in metadata {
                    if merged.contains_key(key) {
                        return Err(LedgerError::MetadataOverride { key: key.clone() });
                    }
                    merged.insert(key.clone(), value.clone());
                }
                ResolvedTransaction {
                    postings: compiled.postings,
                    metadata: merged,
                    account_metadata: compiled.account_metadata,
                }
            }
        };

        resolved.postings.validate()?;
        if let Some(address) = resolved
            .account_metadata
            .keys()
            .find(|address| !is_valid_address(address))
        {
            return Err(LedgerError::validation(format!(
                "invalid account address {address:?} in script metadata"
            )));
        }
        Ok(resolved)
    }
}
