// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bearer token authentication.
//!
//! Every route except `/health` runs behind [`require_bearer`], which maps the
//! presented token to a configured identity and stores it as a [`Caller`]
//! request extension for the handlers.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::config::IdentityConfig;
use crate::errors::UserError;
use crate::service::Caller;

struct TokenEntry {
    token: Vec<u8>,
    subject: String,
}

/// Token to subject lookup.
#[derive(Clone, Default)]
pub struct TokenRegistry {
    entries: Arc<Vec<TokenEntry>>,
}

impl std::fmt::Debug for TokenRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRegistry")
            .field("identities", &self.entries.len())
            .finish()
    }
}

impl TokenRegistry {
    pub fn new<I, T, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (T, S)>,
        T: Into<String>,
        S: Into<String>,
    {
        let entries = pairs
            .into_iter()
            .map(|(token, subject)| TokenEntry {
                token: token.into().into_bytes(),
                subject: subject.into(),
            })
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn from_identities(identities: &[IdentityConfig]) -> Self {
        Self::new(
            identities
                .iter()
                .map(|identity| (identity.token.clone(), identity.subject.clone())),
        )
    }

    /// Subject owning `presented`. Every entry is compared so the time taken
    /// does not depend on which one matches.
    pub fn resolve(&self, presented: &str) -> Option<String> {
        let presented = presented.as_bytes();
        let mut subject = None;
        for entry in self.entries.iter() {
            if bool::from(entry.token.as_slice().ct_eq(presented)) {
                subject = Some(entry.subject.clone());
            }
        }
        subject
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reject requests without a known bearer token.
pub async fn require_bearer(
    State(tokens): State<TokenRegistry>,
    mut request: Request,
    next: Next,
) -> Result<Response, UserError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let Some(token) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
        return Err(UserError::authentication_required(Some(
            "missing or malformed Authorization header",
        )));
    };

    let Some(subject) = tokens.resolve(token.trim()) else {
        return Err(UserError::authentication_required(Some("unknown bearer token")));
    };

    tracing::debug!(subject = %subject, path = %request.uri().path(), "Authenticated request");
    request.extensions_mut().insert(Caller::new(subject));
    Ok(next.run(request).await)
}
