// Copyright 2024-2025 Tree xie.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::{Error, Result, LOG_TARGET, WELL_KNOWN_PATH_PREFIX};
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use substring::Substring;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Token and proof of the authorization being validated.
type Published = Option<(Arc<str>, Arc<str>)>;

/// Proof of control of the authorization currently being validated.
///
/// For a token the first published proof wins, a different token replaces
/// it once the authority moves on to the next authorization. Readers wait
/// for the proof of their token instead of polling for it.
pub struct ChallengeSlot {
    value: watch::Sender<Published>,
}

impl Default for ChallengeSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeSlot {
    pub fn new() -> Self {
        Self {
            value: watch::Sender::new(None),
        }
    }
    /// Publishes the proof of `token`, returns false if the token already
    /// has a proof or either value is empty.
    pub fn publish(&self, token: &str, proof: &str) -> bool {
        if token.is_empty() || proof.is_empty() {
            return false;
        }
        self.value.send_if_modified(|value| {
            if let Some((current, _)) = value {
                if current.as_ref() == token {
                    return false;
                }
            }
            *value = Some((Arc::from(token), Arc::from(proof)));
            true
        })
    }
    /// The published proof.
    pub fn get(&self) -> Option<Arc<str>> {
        self.value.borrow().as_ref().map(|(_, proof)| proof.clone())
    }
    /// Token of the published proof.
    pub fn token(&self) -> Option<Arc<str>> {
        self.value.borrow().as_ref().map(|(token, _)| token.clone())
    }
    /// Clears the slot for the next attempt.
    pub fn reset(&self) {
        self.value.send_replace(None);
    }
    /// Waits until the proof of `token` is published, `None` once
    /// `deadline` passes.
    pub async fn wait(
        &self,
        token: &str,
        deadline: Instant,
    ) -> Option<Arc<str>> {
        let mut receiver = self.value.subscribe();
        let published = async move {
            loop {
                let current = match receiver.borrow_and_update().as_ref() {
                    Some((current, proof)) if current.as_ref() == token => {
                        Some(proof.clone())
                    },
                    _ => None,
                };
                if current.is_some() {
                    return current;
                }
                if receiver.changed().await.is_err() {
                    return None;
                }
            }
        };
        timeout_at(deadline, published).await.unwrap_or_default()
    }
}

/// Lifecycle phase of a [`ChallengeResponder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    Listening,
    Serving,
    Draining,
    Closed,
}

impl From<u8> for ResponderState {
    fn from(value: u8) -> Self {
        match value {
            1 => ResponderState::Listening,
            2 => ResponderState::Serving,
            3 => ResponderState::Draining,
            4 => ResponderState::Closed,
            _ => ResponderState::Idle,
        }
    }
}

struct ResponderShared {
    slot: Arc<ChallengeSlot>,
    deadline: Instant,
    phase: AtomicU8,
    in_flight: AtomicUsize,
    closing: watch::Sender<bool>,
}

impl ResponderShared {
    fn set_phase(&self, state: ResponderState) {
        self.phase.store(state as u8, Ordering::Release);
    }
    fn phase(&self) -> ResponderState {
        self.phase.load(Ordering::Acquire).into()
    }
}

struct InFlight(Arc<ResponderShared>);

impl InFlight {
    fn enter(shared: Arc<ResponderShared>) -> Self {
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let _ = shared.phase.compare_exchange(
            ResponderState::Listening as u8,
            ResponderState::Serving as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Self(shared)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn wait_closing(mut closing: watch::Receiver<bool>) {
    while !*closing.borrow_and_update() {
        if closing.changed().await.is_err() {
            return;
        }
    }
}

/// Answers a path containing the well-known prefix with the proof of its
/// token, everything else is not found.
async fn handle_challenge(
    State(shared): State<Arc<ResponderShared>>,
    uri: Uri,
) -> Response {
    let path = uri.path();
    let Some(index) = path.find(WELL_KNOWN_PATH_PREFIX) else {
        debug!(target: LOG_TARGET, path, "not a challenge request");
        return StatusCode::NOT_FOUND.into_response();
    };
    let token =
        path.substring(index + WELL_KNOWN_PATH_PREFIX.len(), path.len());
    if token.is_empty() || token.contains('/') {
        debug!(target: LOG_TARGET, path, "invalid challenge token");
        return StatusCode::NOT_FOUND.into_response();
    }
    let _in_flight = InFlight::enter(shared.clone());

    // the verification request may arrive before the proof is published
    tokio::select! {
        biased;
        proof = shared.slot.wait(token, shared.deadline) => match proof {
            Some(proof) => {
                info!(target: LOG_TARGET, token, "serve http-01 challenge");
                (StatusCode::OK, proof.to_string()).into_response()
            },
            None => {
                warn!(
                    target: LOG_TARGET,
                    token,
                    "challenge proof is not available before deadline"
                );
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            },
        },
        _ = wait_closing(shared.closing.subscribe()) => {
            warn!(
                target: LOG_TARGET,
                token,
                "responder is closing before the proof is available"
            );
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        },
    }
}

/// Short lived http-01 responder of one issuance attempt.
pub struct ChallengeResponder {
    shared: Arc<ResponderShared>,
    local_addr: Option<SocketAddr>,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl ChallengeResponder {
    /// Creates an idle responder, waiting for the proof never outlasts
    /// `deadline`.
    pub fn new(slot: Arc<ChallengeSlot>, deadline: Instant) -> Self {
        Self {
            shared: Arc::new(ResponderShared {
                slot,
                deadline,
                phase: AtomicU8::new(ResponderState::Idle as u8),
                in_flight: AtomicUsize::new(0),
                closing: watch::Sender::new(false),
            }),
            local_addr: None,
            server: None,
        }
    }
    pub fn state(&self) -> ResponderState {
        self.shared.phase()
    }
    /// Bound address, set once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
    /// Requests currently waiting for or receiving the proof.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }
    /// Binds `addr` and starts serving, a port of `0` binds an ephemeral
    /// port. Bind failures are returned, never retried.
    pub async fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.state() != ResponderState::Idle {
            return Err(Error::Fail {
                category: "responder_listen".to_string(),
                message: format!("responder is {:?}", self.state()),
            });
        }
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            Error::ResponderBind {
                addr: addr.to_string(),
                source: e,
            }
        })?;
        let local_addr =
            listener.local_addr().map_err(|e| Error::ResponderBind {
                addr: addr.to_string(),
                source: e,
            })?;
        let router = Router::new()
            .fallback(handle_challenge)
            .with_state(self.shared.clone());
        let closing = self.shared.closing.subscribe();
        self.server = Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(wait_closing(closing))
                .await
        }));
        self.local_addr = Some(local_addr);
        self.shared.set_phase(ResponderState::Listening);
        info!(
            target: LOG_TARGET,
            addr = local_addr.to_string(),
            "challenge responder is listening"
        );
        Ok(local_addr)
    }
    /// Stops accepting connections, lets in-flight responses finish and
    /// releases the socket.
    pub async fn close(&mut self) {
        if matches!(
            self.state(),
            ResponderState::Idle | ResponderState::Closed
        ) {
            self.shared.set_phase(ResponderState::Closed);
            return;
        }
        self.shared.set_phase(ResponderState::Draining);
        self.shared.closing.send_replace(true);
        if let Some(server) = self.server.take() {
            match server.await {
                Ok(Err(e)) => {
                    error!(
                        target: LOG_TARGET,
                        error = %e,
                        "challenge responder fail"
                    );
                },
                Err(e) => {
                    error!(
                        target: LOG_TARGET,
                        error = %e,
                        "challenge responder task fail"
                    );
                },
                _ => {},
            }
        }
        self.shared.set_phase(ResponderState::Closed);
        info!(
            target: LOG_TARGET,
            addr = ?self.local_addr,
            "challenge responder is closed"
        );
    }
}

impl Drop for ChallengeResponder {
    fn drop(&mut self) {
        if self.server.is_some() {
            self.shared.closing.send_replace(true);
        }
    }
}
