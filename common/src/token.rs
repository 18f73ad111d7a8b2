use chrono::{TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use log::{info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    api::{ApiClient, ApiError},
    config::CredentialConfig,
    platform::{PersistentStore, StoreError, Transport},
};

pub const SNAPSHOT_OFFSET: usize = 0;
pub const REFRESH_TOKEN_CAPACITY: usize = 128;
pub const SNAPSHOT_LEN: usize = 8 + 2 + REFRESH_TOKEN_CAPACITY + CHECKSUM_LEN;
const CHECKSUM_LEN: usize = 8;
const TOKEN_START: usize = 10;
const CHECKSUM_START: usize = TOKEN_START + REFRESH_TOKEN_CAPACITY;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// The part of the credential that survives a power cycle.
///
/// Layout: `[0..8)` refresh time (i64 LE), `[8..10)` token length (u16 LE),
/// `[10..138)` token bytes zero padded, `[138..146)` SHA-256 prefix of `[0..138)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSnapshot {
    pub refresh_token: String,
    pub last_refreshed_at: i64,
}

impl CredentialSnapshot {
    /// Tokens longer than the slot are cut at a char boundary.
    pub fn new(refresh_token: &str, last_refreshed_at: i64) -> Self {
        Self {
            refresh_token: truncate_on_char_boundary(refresh_token, REFRESH_TOKEN_CAPACITY)
                .to_string(),
            last_refreshed_at,
        }
    }

    pub fn encode(&self) -> [u8; SNAPSHOT_LEN] {
        let token = truncate_on_char_boundary(&self.refresh_token, REFRESH_TOKEN_CAPACITY).as_bytes();
        let mut out = [0_u8; SNAPSHOT_LEN];
        out[..8].copy_from_slice(&self.last_refreshed_at.to_le_bytes());
        // Capacity fits in u16.
        out[8..TOKEN_START].copy_from_slice(&(token.len() as u16).to_le_bytes());
        out[TOKEN_START..TOKEN_START + token.len()].copy_from_slice(token);
        let checksum = checksum(&out[..CHECKSUM_START]);
        out[CHECKSUM_START..].copy_from_slice(&checksum);
        out
    }

    /// Returns `None` for erased, torn or foreign data.
    pub fn decode(bytes: &[u8; SNAPSHOT_LEN]) -> Option<Self> {
        if checksum(&bytes[..CHECKSUM_START]) != bytes[CHECKSUM_START..] {
            return None;
        }

        let last_refreshed_at = i64::from_le_bytes(bytes[..8].try_into().ok()?);
        let len = usize::from(u16::from_le_bytes(bytes[8..TOKEN_START].try_into().ok()?));
        if len == 0 || len > REFRESH_TOKEN_CAPACITY {
            return None;
        }
        let refresh_token = std::str::from_utf8(&bytes[TOKEN_START..TOKEN_START + len]).ok()?;

        Some(Self {
            refresh_token: refresh_token.to_string(),
            last_refreshed_at,
        })
    }
}

fn checksum(bytes: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(bytes);
    let mut out = [0_u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

fn truncate_on_char_boundary(value: &str, max_len: usize) -> &str {
    if value.len() <= max_len {
        return value;
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    NoCredential,
    Exchanging,
    Valid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub last_refreshed_at: Option<i64>,
}

/// Daily window in local minutes of day. `poll` fires once per visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshWindow {
    start_minute: u16,
    length_minutes: u16,
    latched: bool,
}

impl RefreshWindow {
    pub fn new(start_minute: u16, length_minutes: u16) -> Self {
        Self {
            start_minute: start_minute % (24 * 60),
            length_minutes,
            latched: false,
        }
    }

    pub fn contains(&self, minute_of_day: u16) -> bool {
        let offset = (minute_of_day + 24 * 60 - self.start_minute) % (24 * 60);
        offset < self.length_minutes
    }

    /// True on the first poll inside the window; re-arms once outside it.
    pub fn poll(&mut self, minute_of_day: u16) -> bool {
        if !self.contains(minute_of_day) {
            self.latched = false;
            return false;
        }
        if self.latched {
            return false;
        }
        self.latched = true;
        true
    }
}

pub fn local_minute_of_day(epoch_secs: i64, timezone: &Tz) -> Option<u16> {
    let now = Utc.timestamp_opt(epoch_secs, 0).single()?.with_timezone(timezone);
    Some(now.hour() as u16 * 60 + now.minute() as u16)
}

/// Owns the credential and the rules for replacing it.
///
/// A failed exchange never clears anything: the previous access token (if
/// any) keeps being used until a later exchange succeeds.
pub struct TokenManager {
    credential: Credential,
    state: TokenState,
    window: RefreshWindow,
    min_valid_epoch: i64,
    max_valid_epoch: i64,
}

impl TokenManager {
    pub fn new(config: &CredentialConfig) -> Self {
        Self {
            credential: Credential {
                refresh_token: config.bootstrap_refresh_token.clone(),
                ..Credential::default()
            },
            state: TokenState::NoCredential,
            window: RefreshWindow::new(
                config.refresh_window_start_minute,
                config.refresh_window_minutes,
            ),
            min_valid_epoch: config.min_valid_epoch,
            max_valid_epoch: config.max_valid_epoch,
        }
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn access_token(&self) -> &str {
        &self.credential.access_token
    }

    pub fn has_access_token(&self) -> bool {
        !self.credential.access_token.is_empty()
    }

    /// Adopts the persisted refresh token when the snapshot is intact and
    /// plausibly dated. Returns whether it was adopted.
    pub fn load_persisted<S: PersistentStore>(&mut self, store: &mut S) -> bool {
        let mut bytes = [0_u8; SNAPSHOT_LEN];
        if let Err(err) = store.get(SNAPSHOT_OFFSET, &mut bytes) {
            warn!("reading credential snapshot failed: {err}");
            return false;
        }

        let Some(snapshot) = CredentialSnapshot::decode(&bytes) else {
            info!("no valid credential snapshot, using bootstrap refresh token");
            return false;
        };
        if !(self.min_valid_epoch..=self.max_valid_epoch).contains(&snapshot.last_refreshed_at) {
            warn!(
                "credential snapshot dated {} is outside the sane range, ignoring",
                snapshot.last_refreshed_at
            );
            return false;
        }

        info!(
            "adopted persisted refresh token from {}",
            snapshot.last_refreshed_at
        );
        self.credential.refresh_token = snapshot.refresh_token;
        self.credential.last_refreshed_at = Some(snapshot.last_refreshed_at);
        true
    }

    /// Runs one exchange. On success returns the refresh time, which the
    /// caller publishes.
    pub fn refresh<T: Transport, S: PersistentStore>(
        &mut self,
        api: &mut ApiClient<T>,
        store: &mut S,
        now_secs: i64,
    ) -> Result<i64, TokenError> {
        if self.credential.refresh_token.is_empty() {
            return Err(TokenError::MissingRefreshToken);
        }

        self.state = TokenState::Exchanging;
        let access = self.has_access_token().then_some(self.credential.access_token.as_str());
        let result = api.exchange_refresh_token(access, &self.credential.refresh_token);

        let grant = match result {
            Ok(grant) => grant,
            Err(err) => {
                self.state = if self.has_access_token() {
                    TokenState::Valid
                } else {
                    TokenState::NoCredential
                };
                return Err(err.into());
            }
        };

        self.credential.access_token = grant.access_token;
        if !grant.refresh_token.is_empty() {
            self.credential.refresh_token = grant.refresh_token;
        }
        self.credential.last_refreshed_at = Some(now_secs);
        self.state = TokenState::Valid;
        info!("credential refreshed at {now_secs}");

        if let Err(err) = self.persist(store, now_secs) {
            warn!("persisting refresh token failed, keeping it in memory: {err}");
        }
        Ok(now_secs)
    }

    /// True once per visit of the daily refresh window.
    pub fn poll_daily_window(&mut self, minute_of_day: u16) -> bool {
        self.window.poll(minute_of_day)
    }

    fn persist<S: PersistentStore>(&self, store: &mut S, now_secs: i64) -> Result<(), StoreError> {
        let snapshot = CredentialSnapshot::new(&self.credential.refresh_token, now_secs);
        store.put(SNAPSHOT_OFFSET, &snapshot.encode())?;
        store.commit()
    }
}
