//! Charge point orchestrator
//!
//! [`ChargePoint`] owns the protocol session: it boots against the Central
//! System, keeps the heartbeat going, answers inbound commands through the
//! [`CommandRouter`] and turns EVSE notifications into outbound requests.
//! Local EVSE state only moves once the Central System has answered, except
//! on the shutdown path where sessions are closed first and reported after.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::TagManager;
use crate::config::{ChargePointConfig, ColorScheme, Config};
use crate::domain::{Display, Evcc, Indicator, PowerMeter, TagReader};
use crate::evse::{Evse, EvseError, EvseManager, EvseSettings, Notification, Notifier, RegistryError};
use crate::hardware::DeviceFactory;
use crate::ocpp::messages::{AvailabilityType, KeyValue, Reason, StatusNotificationRequest};
use crate::ocpp::{Dispatcher, Key, OcppConfiguration, OcppError, Transport};
use crate::repo::{self, Repository};
use crate::scheduler::Scheduler;

mod boot;
mod charging;
mod core_profile;
mod events;
mod local_auth;
mod reservation;
mod router;
mod trigger;

pub use router::CommandRouter;

#[derive(Debug, Error)]
pub enum ChargePointError {
    #[error("charge point is inoperative")]
    Unavailable,
    #[error("no EVSE can take a new session")]
    NoAvailableEvse,
    #[error("tag {0} is not authorized")]
    Unauthorized(String),
    #[error("transaction id {0} is not numeric")]
    InvalidTransactionId(String),
    #[error("no transport configured")]
    MissingTransport,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Evse(#[from] EvseError),
    #[error(transparent)]
    Ocpp(#[from] OcppError),
}

/// Optional front-panel hardware
#[derive(Clone, Default)]
pub struct Peripherals {
    pub reader: Option<Arc<dyn TagReader>>,
    pub display: Option<Arc<dyn Display>>,
    pub indicator: Option<Arc<dyn Indicator>>,
}

struct EvseParts {
    settings: EvseSettings,
    evcc: Arc<dyn Evcc>,
    power_meter: Option<Arc<dyn PowerMeter>>,
}

/// Assembles a [`ChargePoint`] from settings and hardware handles.
pub struct ChargePointBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    repository: Option<Arc<dyn Repository>>,
    configuration: Option<Arc<OcppConfiguration>>,
    evses: Vec<EvseParts>,
    peripherals: Peripherals,
}

impl ChargePointBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            repository: None,
            configuration: None,
            evses: Vec::new(),
            peripherals: Peripherals::default(),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Share an already loaded key store, e.g. with the WebSocket client.
    pub fn configuration(mut self, configuration: Arc<OcppConfiguration>) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub fn evse(mut self, settings: EvseSettings, evcc: Arc<dyn Evcc>, power_meter: Option<Arc<dyn PowerMeter>>) -> Self {
        self.evses.push(EvseParts {
            settings,
            evcc,
            power_meter,
        });
        self
    }

    pub fn peripherals(mut self, peripherals: Peripherals) -> Self {
        self.peripherals = peripherals;
        self
    }

    /// Create the EVSEs and front-panel devices listed in the settings.
    pub fn with_configured_devices(mut self, factory: &DeviceFactory) -> anyhow::Result<Self> {
        for evse in &self.config.evses {
            let settings = EvseSettings {
                evse_id: evse.id,
                max_current: evse.max_current,
                max_charging_time: evse.max_charging_time(),
            };
            let evcc = factory.create_evcc(&evse.evcc)?;
            let power_meter = factory.create_power_meter(evse.power_meter.as_ref())?;
            self.evses.push(EvseParts {
                settings,
                evcc,
                power_meter,
            });
        }
        self.peripherals = Peripherals {
            reader: factory.create_reader()?,
            display: factory.create_display()?,
            indicator: factory.create_indicator()?,
        };
        Ok(self)
    }

    pub async fn build(self) -> Result<Arc<ChargePoint>, ChargePointError> {
        let transport = self.transport.ok_or(ChargePointError::MissingTransport)?;
        let repository = self
            .repository
            .unwrap_or_else(|| repo::from_config(&self.config.storage));
        let configuration = match self.configuration {
            Some(configuration) => configuration,
            None => Arc::new(load_configuration(&self.config, repository.as_ref()).await),
        };
        configuration.set(Key::NumberOfConnectors, self.evses.len());

        let tags = Arc::new(TagManager::new(&configuration));
        match repository.load_tags().await {
            Ok(Some(snapshot)) => tags.restore(snapshot),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load persisted tags"),
        }

        let token = CancellationToken::new();
        let scheduler = Scheduler::new();
        let (notifier, notifications) =
            Notifier::channel(self.config.events.channel_capacity, self.config.events.send_timeout());
        let evses = Arc::new(EvseManager::new(notifier, token.child_token()));

        for parts in self.evses {
            let evse = Evse::new(
                parts.settings,
                parts.evcc,
                parts.power_meter,
                scheduler.clone(),
                configuration.clone(),
            )
            .map_err(ChargePointError::Evse)?
            .with_repository(repository.clone());
            evses.add_evse(Arc::new(evse)).await?;
        }

        let (status_lane, statuses) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            transport,
            configuration.clone(),
            self.config.connection.request_timeout(),
            token.clone(),
        );

        info!(
            charge_point_id = %self.config.charge_point.id,
            evses = evses.len(),
            "charge point assembled"
        );

        Ok(Arc::new(ChargePoint {
            identity: self.config.charge_point,
            colors: self.config.hardware.colors,
            configuration,
            tags,
            evses,
            scheduler,
            dispatcher,
            repository,
            peripherals: self.peripherals,
            availability: RwLock::new(AvailabilityType::Operative),
            registered: AtomicBool::new(false),
            restored: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            notifications: Mutex::new(Some(notifications)),
            status_lane,
            statuses: Mutex::new(Some(statuses)),
            token,
            restart: CancellationToken::new(),
        }))
    }
}

/// OCPP keys: built-in defaults, then the settings file, then values
/// persisted by earlier ChangeConfiguration calls.
pub async fn load_configuration(config: &Config, repository: &dyn Repository) -> OcppConfiguration {
    let mut values: Vec<KeyValue> = initial_values(&config.ocpp);
    match repository.load_configuration().await {
        Ok(persisted) => values.extend(persisted),
        Err(e) => warn!(error = %e, "failed to load persisted OCPP configuration"),
    }
    OcppConfiguration::with_values(&values)
}

fn initial_values(ocpp: &BTreeMap<String, String>) -> Vec<KeyValue> {
    ocpp.iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            readonly: false,
            value: Some(value.clone()),
        })
        .collect()
}

pub struct ChargePoint {
    identity: ChargePointConfig,
    colors: ColorScheme,
    configuration: Arc<OcppConfiguration>,
    tags: Arc<TagManager>,
    evses: Arc<EvseManager>,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    repository: Arc<dyn Repository>,
    peripherals: Peripherals,
    availability: RwLock<AvailabilityType>,
    registered: AtomicBool,
    restored: AtomicBool,
    cleaned_up: AtomicBool,
    notifications: Mutex<Option<mpsc::Receiver<Notification>>>,
    status_lane: mpsc::UnboundedSender<StatusNotificationRequest>,
    statuses: Mutex<Option<mpsc::UnboundedReceiver<StatusNotificationRequest>>>,
    token: CancellationToken,
    restart: CancellationToken,
}

impl ChargePoint {
    pub fn builder(config: Config) -> ChargePointBuilder {
        ChargePointBuilder::new(config)
    }

    /// Start the event pipeline and the tag reader. Booting waits for the transport.
    pub fn start(self: &Arc<Self>) {
        if let Some(notifications) = self.notifications.lock().take() {
            self.spawn_event_loop(notifications);
        }
        if let Some(statuses) = self.statuses.lock().take() {
            self.spawn_status_lane(statuses);
        }
        self.spawn_reader_loop();

        let tags = self.tags.clone();
        self.scheduler
            .every(std::time::Duration::from_secs(3600), &["tag-purge"], move || {
                let tags = tags.clone();
                async move {
                    tags.purge_expired();
                }
            });
        info!(charge_point_id = %self.identity.id, "charge point started");
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn configuration(&self) -> &Arc<OcppConfiguration> {
        &self.configuration
    }

    pub fn tags(&self) -> &Arc<TagManager> {
        &self.tags
    }

    pub fn evses(&self) -> &Arc<EvseManager> {
        &self.evses
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Cancelled once cleanup has finished
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn availability(&self) -> AvailabilityType {
        *self.availability.read()
    }

    pub fn is_operative(&self) -> bool {
        self.availability() == AvailabilityType::Operative
    }

    /// True once a BootNotification was accepted
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Resolves when a Reset asked for the charge point to be rebuilt.
    pub async fn restart_requested(&self) {
        self.restart.cancelled().await
    }

    pub fn is_restart_requested(&self) -> bool {
        self.restart.is_cancelled()
    }

    /// Stop sessions, release hardware and persist tags. Runs once.
    pub async fn cleanup(&self, reason: Reason) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(%reason, "cleaning up charge point");

        if let Err(e) = self.stop_all_transactions(reason).await {
            warn!(error = %e, "not every session could be stopped");
        }
        self.scheduler.clear();
        self.scheduler.stop();
        self.evses.cleanup().await;

        if let Some(reader) = &self.peripherals.reader {
            if let Err(e) = reader.cleanup().await {
                warn!(error = %e, "tag reader cleanup failed");
            }
        }
        if let Some(display) = &self.peripherals.display {
            if let Err(e) = display.cleanup().await {
                warn!(error = %e, "display cleanup failed");
            }
        }
        if let Some(indicator) = &self.peripherals.indicator {
            if let Err(e) = indicator.cleanup().await {
                warn!(error = %e, "indicator cleanup failed");
            }
        }

        self.persist_tags().await;
        self.token.cancel();
        info!("cleanup complete");
    }

    async fn persist_tags(&self) {
        if let Err(e) = self.repository.save_tags(&self.tags.snapshot()).await {
            warn!(error = %e, "failed to persist tags");
        }
    }

    async fn persist_configuration(&self) {
        if let Err(e) = self.repository.save_configuration(&self.configuration.entries()).await {
            warn!(error = %e, "failed to persist OCPP configuration");
        }
    }
}
