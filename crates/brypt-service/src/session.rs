//! Per-peer cryptographic sessions.
//!
//! A session is established by a two-message handshake over
//! `/brypt/handshake`: the initiator offers its suite catalog and one KEM
//! public component per advertised mechanism; the responder selects a suite,
//! encapsulates, and proves key agreement with a MAC over the handshake
//! transcript. The network token binds into the key schedule, so a token
//! mismatch surfaces as a transcript MAC failure.
//!
//! ## Key schedule
//!
//! ```text
//! binding = KDF("network-token-binding", token)
//! master  = KDF("session-master", fields(secret, binding))
//! epoch_n = KDF("session-epoch",  fields(master, n))
//! tx      = KDF("session-tx-key", fields(epoch_n, initiator_id))   (rx on the responder)
//! rx      = KDF("session-rx-key", fields(epoch_n, initiator_id))   (tx on the responder)
//! mac     = KDF("session-mac-key", fields(epoch_n))
//! ```
//!
//! Outbound parcels carry the 64-bit nonce `(epoch << 48) | counter` as the
//! first 8 bytes of the encrypted payload field; the whole encoded parcel is
//! then MACed with the suite digest and the MAC appended as the trailer.
//! Inbound frames are rejected on replay (1024-wide window per epoch) and on
//! MAC failure; three MAC failures inside 60 seconds flag the peer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use brypt_crypto::kdf;
use brypt_crypto::kem::{KemAlgorithm, KemSecretKey};
use brypt_crypto::suite::{AlgorithmsPackage, CipherSuite, SuiteCatalog};
use brypt_message::handshake::{
    HandshakeInit, HandshakeReply, KemPublicEntry, RekeyInit, RekeyReply,
};
use brypt_message::Parcel;
use brypt_types::NodeIdentifier;
use rand::RngCore;
use zeroize::Zeroizing;

/// Counter value that forces a rekey (2^40).
pub const REKEY_COUNTER_LIMIT: u64 = 1 << 40;

/// Default byte budget per epoch before a rekey is forced.
pub const DEFAULT_REKEY_BYTE_BUDGET: u64 = 1 << 30;

/// How long prior-epoch receive keys drain in-flight frames.
pub const RETIRED_KEY_GRACE: Duration = Duration::from_secs(1);

/// Replay window width in messages.
pub const REPLAY_WINDOW: u64 = 1024;

/// MAC failures within [`MAC_ABUSE_WINDOW`] before the peer is flagged.
pub const MAC_ABUSE_LIMIT: usize = 3;

/// Sliding window for MAC-abuse accounting.
pub const MAC_ABUSE_WINDOW: Duration = Duration::from_secs(60);

const COUNTER_MASK: u64 = (1 << 48) - 1;

/// Errors raised while establishing or advancing a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No mutually supported suite exists.
    #[error("no mutually supported cipher suite")]
    NotSupported,

    /// The remote violated the negotiation rules.
    #[error("negotiation conflict: {0}")]
    Conflict(&'static str),

    /// The transcript MAC did not verify.
    #[error("handshake transcript rejected")]
    AccessDenied,

    /// A payload could not be parsed.
    #[error("malformed handshake payload")]
    Malformed,

    /// The session is not in the right lifecycle state.
    #[error("session closed")]
    Closed,

    /// An underlying cryptographic operation failed.
    #[error("crypto failure: {0}")]
    Crypto(#[from] brypt_crypto::CryptoError),
}

/// Faults observed while unprotecting an inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionFault {
    /// The counter was already accepted or fell out of the window.
    Replay,
    /// The trailer MAC or AEAD tag did not verify; `abuse` is set when the
    /// failure count crossed the flagging threshold.
    MacFailure { abuse: bool },
    /// The frame was structurally invalid.
    Malformed,
    /// The session is not active.
    Closed,
}

/// Outcome of protecting an outbound parcel.
pub enum ProtectOutcome {
    /// The wire frame body (parcel bytes plus trailer MAC).
    Frame(Vec<u8>),
    /// A rekey is in flight; the parcel was queued for the new epoch.
    Queued,
}

/// Which side of the handshake this session took.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Session lifecycle. A session transitions pending → active at most once;
/// rekeys change epoch sub-keys without revisiting the lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    TornDown,
}

/// Sliding replay window over the per-epoch counter.
struct ReplayWindow {
    highest: Option<u64>,
    bits: [u64; 16],
}

impl ReplayWindow {
    fn new() -> Self {
        Self { highest: None, bits: [0u64; 16] }
    }

    /// Whether `counter` is fresh, without mutating the window.
    fn check(&self, counter: u64) -> bool {
        match self.highest {
            None => true,
            Some(highest) if counter > highest => true,
            Some(highest) => {
                let delta = highest - counter;
                if delta >= REPLAY_WINDOW {
                    return false;
                }
                !self.bit(delta)
            }
        }
    }

    /// Record an accepted counter.
    fn accept(&mut self, counter: u64) {
        match self.highest {
            None => {
                self.highest = Some(counter);
                self.set_bit(0);
            }
            Some(highest) if counter > highest => {
                self.shift(counter - highest);
                self.highest = Some(counter);
                self.set_bit(0);
            }
            Some(highest) => {
                let delta = highest - counter;
                if delta < REPLAY_WINDOW {
                    self.set_bit(delta);
                }
            }
        }
    }

    fn bit(&self, offset: u64) -> bool {
        let word = (offset / 64) as usize;
        let bit = offset % 64;
        self.bits[word] & (1u64 << bit) != 0
    }

    fn set_bit(&mut self, offset: u64) {
        let word = (offset / 64) as usize;
        let bit = offset % 64;
        self.bits[word] |= 1u64 << bit;
    }

    /// Slide the window forward by `delta` positions.
    fn shift(&mut self, delta: u64) {
        if delta >= REPLAY_WINDOW {
            self.bits = [0u64; 16];
            return;
        }
        let words = (delta / 64) as usize;
        let bits = (delta % 64) as u32;
        if words > 0 {
            for index in (0..16).rev() {
                self.bits[index] = if index >= words { self.bits[index - words] } else { 0 };
            }
        }
        if bits > 0 {
            let mut carry = 0u64;
            for word in self.bits.iter_mut() {
                let next_carry = *word >> (64 - bits);
                *word = (*word << bits) | carry;
                carry = next_carry;
            }
        }
    }
}

/// The symmetric material of one epoch.
struct EpochKeys {
    epoch: u16,
    tx: Zeroizing<Vec<u8>>,
    rx: Zeroizing<Vec<u8>>,
    mac: Zeroizing<[u8; 32]>,
    window: ReplayWindow,
}

impl EpochKeys {
    fn derive(
        master: &[u8; 32],
        suite: &CipherSuite,
        epoch: u16,
        initiator: &NodeIdentifier,
        role: Role,
    ) -> Self {
        let epoch_secret = kdf::derive_key(
            kdf::contexts::SESSION_EPOCH,
            &kdf::encode_fields(&[master, &epoch.to_be_bytes()]),
        );
        let material = kdf::encode_fields(&[&epoch_secret, initiator.as_bytes()]);
        let forward = kdf::derive_key(kdf::contexts::SESSION_TX_KEY, &material);
        let backward = kdf::derive_key(kdf::contexts::SESSION_RX_KEY, &material);
        let mac = kdf::derive_key(
            kdf::contexts::SESSION_MAC_KEY,
            &kdf::encode_fields(&[&epoch_secret]),
        );

        // The initiator transmits on the forward key; the responder's
        // directions are swapped.
        let (tx_full, rx_full) = match role {
            Role::Initiator => (forward, backward),
            Role::Responder => (backward, forward),
        };
        let key_size = suite.cipher.key_size();
        Self {
            epoch,
            tx: Zeroizing::new(tx_full[..key_size].to_vec()),
            rx: Zeroizing::new(rx_full[..key_size].to_vec()),
            mac: Zeroizing::new(mac),
            window: ReplayWindow::new(),
        }
    }
}

struct PendingRekey {
    epoch: u16,
    nonce: [u8; 32],
    queued: Vec<Parcel>,
}

/// An established per-peer cryptographic context.
pub struct Session {
    suite: CipherSuite,
    role: Role,
    state: SessionState,
    master: Zeroizing<[u8; 32]>,
    initiator: NodeIdentifier,
    keys: EpochKeys,
    retired: Option<(EpochKeys, Instant)>,
    tx_counter: u64,
    tx_bytes: u64,
    byte_budget: u64,
    mac_failures: VecDeque<Instant>,
    pending_rekey: Option<PendingRekey>,
}

impl Session {
    fn activate(
        suite: CipherSuite,
        role: Role,
        master: Zeroizing<[u8; 32]>,
        initiator: NodeIdentifier,
    ) -> Self {
        let keys = EpochKeys::derive(&master, &suite, 0, &initiator, role);
        Self {
            suite,
            role,
            state: SessionState::Active,
            master,
            initiator,
            keys,
            retired: None,
            tx_counter: 0,
            tx_bytes: 0,
            byte_budget: DEFAULT_REKEY_BYTE_BUDGET,
            mac_failures: VecDeque::new(),
            pending_rekey: None,
        }
    }

    /// The negotiated suite.
    pub fn suite(&self) -> &CipherSuite {
        &self.suite
    }

    /// The handshake role this side took.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current rekey epoch.
    pub fn epoch(&self) -> u16 {
        self.keys.epoch
    }

    /// True while the session can protect and unprotect traffic.
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Override the per-epoch byte budget.
    pub fn set_byte_budget(&mut self, budget: u64) {
        self.byte_budget = budget;
    }

    /// Whether the current epoch exhausted its counter or byte budget.
    pub fn needs_rekey(&self) -> bool {
        self.pending_rekey.is_none()
            && (self.tx_counter >= REKEY_COUNTER_LIMIT || self.tx_bytes >= self.byte_budget)
    }

    /// MAC and encrypt an outbound parcel, producing the wire frame body.
    ///
    /// While a rekey is in flight the parcel is queued instead and flushed
    /// by [`Session::apply_rekey_reply`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] unless the session is active.
    pub fn protect(&mut self, mut parcel: Parcel) -> Result<ProtectOutcome, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Closed);
        }
        if let Some(pending) = self.pending_rekey.as_mut() {
            pending.queued.push(parcel);
            return Ok(ProtectOutcome::Queued);
        }

        let counter = self.tx_counter;
        self.tx_counter += 1;
        let nonce = (u64::from(self.keys.epoch) << 48) | (counter & COUNTER_MASK);

        self.suite.cipher.encrypt(&self.keys.tx, nonce, &mut parcel.payload)?;
        let mut sealed = Vec::with_capacity(8 + parcel.payload.len());
        sealed.extend_from_slice(&nonce.to_be_bytes());
        sealed.append(&mut parcel.payload);
        parcel.payload = sealed;
        parcel.flags.encrypted = true;

        let mut body = parcel.encode().map_err(|_| SessionError::Malformed)?;
        let mac = self.suite.digest.mac(&self.keys.mac, &body)?;
        body.extend_from_slice(&mac);
        self.tx_bytes += body.len() as u64;
        Ok(ProtectOutcome::Frame(body))
    }

    /// Verify and decrypt an inbound frame body.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionFault`] describing why the frame was dropped.
    pub fn unprotect(&mut self, frame: &[u8]) -> Result<Parcel, SessionFault> {
        if !self.is_active() {
            return Err(SessionFault::Closed);
        }
        let mac_size = self.suite.digest.mac_size();
        if frame.len() <= mac_size {
            return Err(SessionFault::Malformed);
        }
        let (body, tag) = frame.split_at(frame.len() - mac_size);

        self.drop_expired_retired();
        let epoch = self.peek_epoch(body)?;
        let use_retired = epoch != self.keys.epoch;
        if use_retired {
            let matches_retired =
                self.retired.as_ref().is_some_and(|(keys, _)| keys.epoch == epoch);
            if !matches_retired {
                return Err(SessionFault::Replay);
            }
        }

        let mac_key: [u8; 32] = if use_retired {
            match self.retired.as_ref() {
                Some((keys, _)) => *keys.mac,
                None => return Err(SessionFault::Replay),
            }
        } else {
            *self.keys.mac
        };
        if self.suite.digest.verify(&mac_key, body, tag).is_err() {
            let abuse = self.record_mac_failure();
            return Err(SessionFault::MacFailure { abuse });
        }

        let mut parcel = Parcel::decode(body).map_err(|_| SessionFault::Malformed)?;
        if !parcel.flags.encrypted || parcel.payload.len() < 8 {
            return Err(SessionFault::Malformed);
        }
        let nonce_bytes: [u8; 8] =
            parcel.payload[..8].try_into().map_err(|_| SessionFault::Malformed)?;
        let nonce = u64::from_be_bytes(nonce_bytes);
        let counter = nonce & COUNTER_MASK;

        let cipher = self.suite.cipher;
        let mut ciphertext = parcel.payload.split_off(8);
        let decrypted = {
            let keys = if use_retired {
                match self.retired.as_mut() {
                    Some((keys, _)) => keys,
                    None => return Err(SessionFault::Replay),
                }
            } else {
                &mut self.keys
            };
            if !keys.window.check(counter) {
                return Err(SessionFault::Replay);
            }
            let decrypted = cipher.decrypt(&keys.rx, nonce, &mut ciphertext).is_ok();
            if decrypted {
                keys.window.accept(counter);
            }
            decrypted
        };
        if !decrypted {
            let abuse = self.record_mac_failure();
            return Err(SessionFault::MacFailure { abuse });
        }

        parcel.payload = ciphertext;
        parcel.flags.encrypted = false;
        Ok(parcel)
    }

    fn peek_epoch(&self, body: &[u8]) -> Result<u16, SessionFault> {
        // The nonce sits at the head of the payload field; decode locates it.
        let parcel = Parcel::decode(body).map_err(|_| SessionFault::Malformed)?;
        if parcel.payload.len() < 8 {
            return Err(SessionFault::Malformed);
        }
        let nonce_bytes: [u8; 8] =
            parcel.payload[..8].try_into().map_err(|_| SessionFault::Malformed)?;
        Ok((u64::from_be_bytes(nonce_bytes) >> 48) as u16)
    }

    fn record_mac_failure(&mut self) -> bool {
        let now = Instant::now();
        while let Some(front) = self.mac_failures.front() {
            if now.duration_since(*front) > MAC_ABUSE_WINDOW {
                self.mac_failures.pop_front();
            } else {
                break;
            }
        }
        self.mac_failures.push_back(now);
        self.mac_failures.len() >= MAC_ABUSE_LIMIT
    }

    fn drop_expired_retired(&mut self) {
        if let Some((_, retired_at)) = self.retired.as_ref() {
            if retired_at.elapsed() > RETIRED_KEY_GRACE {
                self.retired = None;
            }
        }
    }

    /// Begin a rekey toward the next epoch. Outbound application traffic is
    /// paused and queued until [`Session::apply_rekey_reply`] confirms.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Conflict`] if a rekey is already in flight.
    pub fn initiate_rekey(&mut self) -> Result<RekeyInit, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Closed);
        }
        if self.pending_rekey.is_some() {
            return Err(SessionError::Conflict("rekey already in flight"));
        }
        let epoch = self.keys.epoch.wrapping_add(1);
        let mut nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        self.pending_rekey = Some(PendingRekey { epoch, nonce, queued: Vec::new() });
        Ok(RekeyInit { epoch, nonce })
    }

    /// Answer a remote rekey proposal: adopt the new epoch and confirm it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Conflict`] when the proposed epoch is not the
    /// successor of the current one.
    pub fn apply_rekey_init(&mut self, init: &RekeyInit) -> Result<RekeyReply, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Closed);
        }
        if init.epoch != self.keys.epoch.wrapping_add(1) {
            return Err(SessionError::Conflict("unexpected rekey epoch"));
        }
        let next = EpochKeys::derive(&self.master, &self.suite, init.epoch, &self.initiator, self.role);
        let confirm_mac = self.suite.digest.mac(&next.mac, &init.nonce)?;
        self.adopt_epoch(next);
        Ok(RekeyReply { epoch: init.epoch, confirm_mac })
    }

    /// Complete a rekey we initiated, returning queued parcels to flush.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AccessDenied`] when the confirmation MAC does
    /// not verify under the new epoch's keys.
    pub fn apply_rekey_reply(&mut self, reply: &RekeyReply) -> Result<Vec<Parcel>, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Closed);
        }
        let pending = self.pending_rekey.take().ok_or(SessionError::Conflict("no rekey in flight"))?;
        if reply.epoch != pending.epoch {
            self.pending_rekey = Some(pending);
            return Err(SessionError::Conflict("unexpected rekey epoch"));
        }
        let next =
            EpochKeys::derive(&self.master, &self.suite, pending.epoch, &self.initiator, self.role);
        if self.suite.digest.verify(&next.mac, &pending.nonce, &reply.confirm_mac).is_err() {
            return Err(SessionError::AccessDenied);
        }
        self.adopt_epoch(next);
        Ok(pending.queued)
    }

    fn adopt_epoch(&mut self, next: EpochKeys) {
        let previous = std::mem::replace(&mut self.keys, next);
        self.retired = Some((previous, Instant::now()));
        self.tx_counter = 0;
        self.tx_bytes = 0;
    }

    /// Tear the session down, destroying key material.
    pub fn teardown(&mut self) {
        self.state = SessionState::TornDown;
        self.retired = None;
        self.pending_rekey = None;
        // Keys zeroize on drop; replace them with inert material now.
        self.keys = EpochKeys {
            epoch: self.keys.epoch,
            tx: Zeroizing::new(Vec::new()),
            rx: Zeroizing::new(Vec::new()),
            mac: Zeroizing::new([0u8; 32]),
            window: ReplayWindow::new(),
        };
        self.master = Zeroizing::new([0u8; 32]);
    }
}

/// Initiator-side handshake state, alive between init and reply.
pub struct HandshakeInitiator {
    catalog: SuiteCatalog,
    token: String,
    local: NodeIdentifier,
    secrets: Vec<KemSecretKey>,
    init_bytes: Vec<u8>,
}

impl HandshakeInitiator {
    /// Build the init message, generating one keypair per advertised KEM.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Malformed`] when the init cannot be encoded.
    pub fn new(
        catalog: &SuiteCatalog,
        token: &str,
        local: NodeIdentifier,
    ) -> Result<(Self, HandshakeInit), SessionError> {
        let mut secrets = Vec::new();
        let mut key_agreements = Vec::new();
        for kem in catalog.key_agreements() {
            let (public, secret) = kem.generate_keypair();
            key_agreements.push(KemPublicEntry {
                kem: kem.name().to_string(),
                public: public.as_bytes().to_vec(),
            });
            secrets.push(secret);
        }

        let mut nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let init = HandshakeInit {
            advertised: catalog.packages().to_vec(),
            key_agreements,
            nonce,
        };
        let init_bytes = init.to_bytes().map_err(|_| SessionError::Malformed)?;

        Ok((
            Self {
                catalog: catalog.clone(),
                token: token.to_string(),
                local,
                secrets,
                init_bytes,
            },
            init,
        ))
    }

    /// Consume the responder's reply and produce the active session.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Conflict`] when the echoed suite is not one this
    ///   catalog could have chosen.
    /// - [`SessionError::AccessDenied`] when the transcript MAC fails, which
    ///   includes a network-token mismatch.
    pub fn finalize(self, reply: &HandshakeReply) -> Result<Session, SessionError> {
        if !self.catalog.contains(&reply.suite) {
            return Err(SessionError::Conflict("responder chose an unoffered suite"));
        }
        let secret = self
            .secrets
            .iter()
            .find(|secret| secret.algorithm() == reply.suite.kem)
            .ok_or(SessionError::Conflict("no secret for the chosen mechanism"))?;

        let shared = reply.suite.kem.decapsulate(secret, &reply.ciphertext)?;
        let master = derive_master(shared.as_bytes(), &self.token);
        let keys = EpochKeys::derive(&master, &reply.suite, 0, &self.local, Role::Initiator);

        verify_transcript(&reply.suite, &keys, &self.init_bytes, reply)?;

        Ok(Session::activate(reply.suite, Role::Initiator, master, self.local))
    }
}

/// Responder side: select a suite, encapsulate, and build the reply.
///
/// `initiator` is the remote's identifier from the init parcel; the key
/// schedule binds it on both sides.
///
/// # Errors
///
/// - [`SessionError::NotSupported`] when the catalogs do not intersect.
/// - [`SessionError::Conflict`] when the init omits a public component for
///   the selected mechanism.
pub fn respond(
    catalog: &SuiteCatalog,
    token: &str,
    initiator: NodeIdentifier,
    init: &HandshakeInit,
    init_bytes: &[u8],
) -> Result<(Session, HandshakeReply), SessionError> {
    // Selection preserves the initiator's preference order, so the remote's
    // advertisement takes the initiator position. Unknown names in a foreign
    // advertisement are skipped rather than fatal.
    let remote = sanitize_packages(&init.advertised);
    let remote_catalog = SuiteCatalog::new(remote).map_err(|_| SessionError::Malformed)?;
    let suite = remote_catalog
        .select(catalog.packages())
        .map_err(|_| SessionError::NotSupported)?;

    let entry = init
        .key_agreements
        .iter()
        .find(|entry| entry.kem == suite.kem.name())
        .ok_or(SessionError::Conflict("init lacks a component for the chosen mechanism"))?;

    let (ciphertext, shared) = suite.kem.encapsulate(&entry.public)?;
    let master = derive_master(shared.as_bytes(), token);
    let keys = EpochKeys::derive(&master, &suite, 0, &initiator, Role::Responder);

    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let mut reply = HandshakeReply { suite, ciphertext, nonce, transcript_mac: Vec::new() };

    let core = reply.to_bytes().map_err(|_| SessionError::Malformed)?;
    let transcript = kdf::encode_fields(&[init_bytes, &core]);
    reply.transcript_mac = suite.digest.mac(&keys.mac, &transcript)?;

    let session = Session::activate(suite, Role::Responder, master, initiator);
    Ok((session, reply))
}

fn derive_master(shared: &[u8; 32], token: &str) -> Zeroizing<[u8; 32]> {
    let binding = kdf::derive_key(kdf::contexts::TOKEN_BINDING, token.as_bytes());
    Zeroizing::new(kdf::derive_key(
        kdf::contexts::SESSION_MASTER,
        &kdf::encode_fields(&[shared, &binding]),
    ))
}

fn verify_transcript(
    suite: &CipherSuite,
    keys: &EpochKeys,
    init_bytes: &[u8],
    reply: &HandshakeReply,
) -> Result<(), SessionError> {
    let mut core = reply.clone();
    core.transcript_mac = Vec::new();
    let core_bytes = core.to_bytes().map_err(|_| SessionError::Malformed)?;
    let transcript = kdf::encode_fields(&[init_bytes, &core_bytes]);
    suite
        .digest
        .verify(&keys.mac, &transcript, &reply.transcript_mac)
        .map_err(|_| SessionError::AccessDenied)
}

fn sanitize_packages(advertised: &[AlgorithmsPackage]) -> Vec<AlgorithmsPackage> {
    use brypt_crypto::cipher::CipherAlgorithm;
    use brypt_crypto::digest::DigestAlgorithm;

    let mut seen = Vec::new();
    advertised
        .iter()
        .filter(|package| {
            if seen.contains(&package.level) {
                return false;
            }
            seen.push(package.level);
            true
        })
        .map(|package| AlgorithmsPackage {
            level: package.level,
            key_agreements: package
                .key_agreements
                .iter()
                .filter(|name| KemAlgorithm::from_name(name).is_some())
                .cloned()
                .collect(),
            ciphers: package
                .ciphers
                .iter()
                .filter(|name| CipherAlgorithm::from_name(name).is_some())
                .cloned()
                .collect(),
            digests: package
                .digests
                .iter()
                .filter(|name| DigestAlgorithm::from_name(name).is_some())
                .cloned()
                .collect(),
        })
        .collect()
}
