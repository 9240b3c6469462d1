//! Session creation and resumption.
//!
//! The resolver turns either a payment intent or a persisted channel id into
//! a running [`Session`]. Resumption never loops: a failed lookup clears the
//! persisted id and hands the decision back to the caller.

use std::sync::Arc;

use tracing::{info, warn};

use super::config::SessionConfig;
use super::core::{Session, SessionError};
use super::telemetry::{NoopTelemetry, SessionTelemetry};
use crate::channel::Channel;
use crate::http::{CreateOutcome, HttpClient, HttpError, PaymentIntent};
use crate::store::ChannelIdStore;

/// Creates or resumes sessions against one status authority.
#[derive(Clone)]
pub struct SessionResolver {
    http_client: HttpClient,
    store: Arc<dyn ChannelIdStore>,
    config: SessionConfig,
    telemetry: Arc<dyn SessionTelemetry>,
}

impl std::fmt::Debug for SessionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResolver")
            .field("base_url", &self.http_client.base_url())
            .field("store", &self.store)
            .field("config", &self.config)
            .finish()
    }
}

impl SessionResolver {
    pub fn new(
        http_client: HttpClient,
        store: Arc<dyn ChannelIdStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            http_client,
            store,
            config,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Installs a telemetry sink for every session started afterwards.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn SessionTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn store(&self) -> &Arc<dyn ChannelIdStore> {
        &self.store
    }

    /// Creates a channel for `intent` and starts watching it.
    ///
    /// When the authority already tracks a channel for this intent the
    /// existing channel is resumed instead.
    pub async fn create(&self, intent: &PaymentIntent) -> Result<Session, SessionError> {
        match self
            .http_client
            .create_channel(intent)
            .await
            .map_err(SessionError::Create)?
        {
            CreateOutcome::Created(descriptor) => {
                let channel = Channel::from_descriptor(descriptor)?;
                self.store.save(&channel.id)?;
                info!(
                    channel_id = %channel.id,
                    intent_id = %intent.intent_id,
                    status = channel.status.as_str(),
                    "channel created"
                );
                Ok(self.start(channel))
            }
            CreateOutcome::Existing { channel_id } => {
                info!(
                    channel_id = %channel_id,
                    intent_id = %intent.intent_id,
                    "channel already exists for intent; resuming"
                );
                self.resume(&channel_id).await
            }
        }
    }

    /// Rebuilds a session from the authority's current view of `channel_id`.
    ///
    /// Any failure clears the persisted id and returns
    /// [`SessionError::Resume`]; callers restart through [`Self::create`].
    pub async fn resume(&self, channel_id: &str) -> Result<Session, SessionError> {
        let descriptor = match self.http_client.fetch_status(channel_id).await {
            Ok(descriptor) if descriptor.channel_id == channel_id => descriptor,
            Ok(descriptor) => {
                warn!(
                    channel_id,
                    returned = %descriptor.channel_id,
                    "status authority returned a different channel"
                );
                return Err(self.resume_failed(channel_id, HttpError::NotFound));
            }
            Err(err) => return Err(self.resume_failed(channel_id, err)),
        };
        let channel = match Channel::from_descriptor(descriptor) {
            Ok(channel) => channel,
            Err(err) => return Err(self.resume_failed(channel_id, HttpError::Payload(err))),
        };
        if !channel.is_terminal() {
            self.store.save(&channel.id)?;
        }
        info!(
            channel_id = %channel.id,
            status = channel.status.as_str(),
            "channel resumed"
        );
        Ok(self.start(channel))
    }

    /// Resumes the persisted channel, if any.
    pub async fn resume_persisted(&self) -> Result<Option<Session>, SessionError> {
        match self.store.load()? {
            Some(channel_id) => self.resume(&channel_id).await.map(Some),
            None => Ok(None),
        }
    }

    fn resume_failed(&self, channel_id: &str, source: HttpError) -> SessionError {
        warn!(channel_id, "failed to resume channel: {source}");
        if let Err(err) = self.store.clear() {
            warn!(channel_id, "failed to clear persisted channel id: {err}");
        }
        SessionError::Resume {
            channel_id: channel_id.to_string(),
            source,
        }
    }

    fn start(&self, channel: Channel) -> Session {
        Session::start(
            self.http_client.clone(),
            self.store.clone(),
            channel,
            self.config.clone(),
            self.telemetry.clone(),
        )
    }
}
