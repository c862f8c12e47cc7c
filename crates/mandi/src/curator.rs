//! Essential data bundles for offline use.
//!
//! The [`EssentialDataCurator`] assembles the minimal set of prices, mandis,
//! support prices and weather a device needs around a location. Bundles are
//! built from whatever is cached; a type with no data is simply left empty.
//! Preparation jobs build the same bundle in the background and report their
//! progress as each data type completes.

use chrono::{DateTime, Utc};
use mandi_cache::CacheStore;
use mandi_core::{
    CacheEntry, CacheError, Clock, ContentFilter, DataType, ESSENTIAL_COMMODITIES, GeoPoint,
    MaxAgePolicy, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Per-type limits of an essential bundle.
///
/// Staleness is judged against the [`MaxAgePolicy`] the curator was given,
/// the same one that sets the TTL of synced entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionLimits {
    /// Entries kept in the bundle.
    pub max_entries: usize,
}

impl SectionLimits {
    const fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }
}

fn default_prices() -> SectionLimits {
    SectionLimits::new(100)
}

fn default_mandis() -> SectionLimits {
    SectionLimits::new(50)
}

fn default_msp_rates() -> SectionLimits {
    SectionLimits::new(50)
}

fn default_weather() -> SectionLimits {
    SectionLimits::new(10)
}

fn default_radius_km() -> f64 {
    100.0
}

fn default_retention_hours() -> u64 {
    24
}

/// Limits and defaults of the curator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratorConfig {
    /// Price section.
    #[serde(default = "default_prices")]
    pub prices: SectionLimits,
    /// Mandi section.
    #[serde(default = "default_mandis")]
    pub mandis: SectionLimits,
    /// Support-price section.
    #[serde(default = "default_msp_rates")]
    pub msp_rates: SectionLimits,
    /// Weather section.
    #[serde(default = "default_weather")]
    pub weather: SectionLimits,
    /// Radius used when a request gives none.
    #[serde(default = "default_radius_km")]
    pub default_radius_km: f64,
    /// Hours a finished preparation job stays queryable.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            prices: default_prices(),
            mandis: default_mandis(),
            msp_rates: default_msp_rates(),
            weather: default_weather(),
            default_radius_km: default_radius_km(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl CuratorConfig {
    /// Limits of the section holding `data_type`, if it is essential.
    #[must_use]
    pub const fn limits(&self, data_type: DataType) -> Option<SectionLimits> {
        match data_type {
            DataType::Price => Some(self.prices),
            DataType::MandiInfo => Some(self.mandis),
            DataType::MspRate => Some(self.msp_rates),
            DataType::Weather => Some(self.weather),
            _ => None,
        }
    }

    /// How long finished jobs are kept.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}

fn hours(duration: Duration) -> f64 {
    duration.as_secs_f64() / 3600.0
}

/// Where and for what a bundle is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EssentialRequest {
    /// Centre of the area.
    pub location: GeoPoint,
    /// Radius of the area in kilometres.
    pub radius_km: f64,
    /// Commodities of interest, normalized to lowercase.
    pub commodities: Vec<String>,
}

impl EssentialRequest {
    /// A request around `location` for the staple commodities.
    #[must_use]
    pub fn new(location: GeoPoint, radius_km: f64) -> Self {
        Self {
            location,
            radius_km,
            commodities: ESSENTIAL_COMMODITIES.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    /// Replaces the commodities; an empty list keeps the staples.
    #[must_use]
    pub fn with_commodities<I, S>(mut self, commodities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list: Vec<String> = Vec::new();
        for commodity in commodities {
            let commodity = commodity.as_ref().trim().to_lowercase();
            if !commodity.is_empty() && !list.contains(&commodity) {
                list.push(commodity);
            }
        }
        if !list.is_empty() {
            self.commodities = list;
        }
        self
    }

    /// Checks the location and radius.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for bad coordinates or a radius that
    /// is not a positive number.
    pub fn validate(&self) -> Result<()> {
        self.location.validate()?;
        if !self.radius_km.is_finite() || self.radius_km <= 0.0 {
            return Err(CacheError::Validation(format!(
                "radius_km must be positive, got {}",
                self.radius_km
            )));
        }
        Ok(())
    }

    fn filter(&self, data_type: DataType) -> ContentFilter {
        match data_type {
            DataType::Price => ContentFilter::new()
                .with_commodities(&self.commodities)
                .near(self.location, self.radius_km),
            DataType::MspRate => ContentFilter::new().with_commodities(&self.commodities),
            _ => ContentFilter::new().near(self.location, self.radius_km),
        }
    }
}

/// Age of the least fresh entry of one section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Freshness {
    /// Oldest `updated_at` in the section.
    pub as_of: DateTime<Utc>,
    /// Hours since `as_of`.
    pub age_hours: f64,
    /// True when older than the section's max age.
    pub stale: bool,
}

/// Minimal multi-type data set for offline operation around a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EssentialDataPackage {
    /// Centre of the area.
    pub location: GeoPoint,
    /// Radius in kilometres.
    pub radius_km: f64,
    /// Commodities the bundle was built for.
    pub commodities: Vec<String>,
    /// Prices, most relevant first.
    pub prices: Vec<CacheEntry>,
    /// Mandis, nearest first.
    pub mandis: Vec<CacheEntry>,
    /// Support prices.
    pub msp_rates: Vec<CacheEntry>,
    /// Weather reports, nearest first.
    pub weather: Vec<CacheEntry>,
    /// Freshness of each non-empty section; empty sections are absent.
    pub data_freshness: BTreeMap<DataType, Freshness>,
    /// Hours until the first present section exceeds its max age.
    pub estimated_validity_hours: f64,
    /// Sum of entry sizes.
    pub size_bytes: u64,
    /// When the bundle was built.
    pub generated_at: DateTime<Utc>,
}

impl EssentialDataPackage {
    fn new(request: &EssentialRequest, now: DateTime<Utc>) -> Self {
        Self {
            location: request.location,
            radius_km: request.radius_km,
            commodities: request.commodities.clone(),
            prices: Vec::new(),
            mandis: Vec::new(),
            msp_rates: Vec::new(),
            weather: Vec::new(),
            data_freshness: BTreeMap::new(),
            estimated_validity_hours: 0.0,
            size_bytes: 0,
            generated_at: now,
        }
    }

    /// Entries of the section holding `data_type`.
    #[must_use]
    pub fn section(&self, data_type: DataType) -> &[CacheEntry] {
        match data_type {
            DataType::Price => &self.prices,
            DataType::MandiInfo => &self.mandis,
            DataType::MspRate => &self.msp_rates,
            DataType::Weather => &self.weather,
            _ => &[],
        }
    }

    /// Total entries across sections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prices.len() + self.mandis.len() + self.msp_rates.len() + self.weather.len()
    }

    /// Returns true if no section has data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, data_type: DataType, entries: Vec<CacheEntry>, max_age: Duration, now: DateTime<Utc>) {
        if let Some(oldest) = entries.iter().map(|e| e.updated_at).min() {
            let age_hours = now.signed_duration_since(oldest).num_seconds().max(0) as f64 / 3600.0;
            self.data_freshness.insert(
                data_type,
                Freshness {
                    as_of: oldest,
                    age_hours,
                    stale: age_hours > hours(max_age),
                },
            );
        }
        self.size_bytes += entries.iter().map(|e| e.size_bytes).sum::<u64>();
        match data_type {
            DataType::Price => self.prices = entries,
            DataType::MandiInfo => self.mandis = entries,
            DataType::MspRate => self.msp_rates = entries,
            DataType::Weather => self.weather = entries,
            _ => {}
        }
    }

    fn finalize(&mut self, max_age: &MaxAgePolicy) {
        self.estimated_validity_hours = self
            .data_freshness
            .iter()
            .map(|(data_type, freshness)| {
                (hours(max_age.max_age(*data_type)) - freshness.age_hours).max(0.0)
            })
            .reduce(f64::min)
            .unwrap_or(0.0);
    }
}

/// Lifecycle of a preparation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreparationStatus {
    /// Sections are being collected.
    Preparing,
    /// The package is ready.
    Completed,
    /// A section could not be read.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl PreparationStatus {
    /// Returns true once the job can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Preparing)
    }
}

/// Observable state of a preparation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflinePreparation {
    /// Job identifier.
    pub id: Uuid,
    /// What the job builds.
    pub request: EssentialRequest,
    /// Current status.
    pub status: PreparationStatus,
    /// Progress from 0 to 100.
    pub progress_percentage: f64,
    /// Job start.
    pub started_at: DateTime<Utc>,
    /// Job end.
    pub completed_at: Option<DateTime<Utc>>,
    /// Size of the finished package.
    pub data_size_bytes: u64,
    /// Failure message.
    pub error: Option<String>,
}

/// Sections in collection order with the progress reached after each.
const STEPS: [(DataType, f64); 4] = [
    (DataType::Price, 40.0),
    (DataType::MandiInfo, 60.0),
    (DataType::MspRate, 70.0),
    (DataType::Weather, 80.0),
];

#[derive(Debug)]
struct Job {
    state: watch::Sender<OfflinePreparation>,
    cancelled: AtomicBool,
    package: OnceLock<EssentialDataPackage>,
}

impl Job {
    fn update(&self, f: impl FnOnce(&mut OfflinePreparation)) -> bool {
        self.state.send_if_modified(|state| {
            if state.status.is_terminal() {
                return false;
            }
            f(state);
            true
        })
    }
}

/// Builds essential bundles and runs preparation jobs.
#[derive(Debug)]
pub struct EssentialDataCurator {
    store: Arc<CacheStore>,
    clock: Arc<dyn Clock>,
    config: CuratorConfig,
    max_age: MaxAgePolicy,
    jobs: RwLock<HashMap<Uuid, Arc<Job>>>,
}

impl EssentialDataCurator {
    /// A curator reading from `store`, judging freshness by the default
    /// max ages.
    #[must_use]
    pub fn new(store: Arc<CacheStore>, clock: Arc<dyn Clock>, config: CuratorConfig) -> Self {
        Self {
            store,
            clock,
            config,
            max_age: MaxAgePolicy::default(),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Judges freshness by `max_age` instead of the defaults.
    #[must_use]
    pub fn with_max_age(mut self, max_age: MaxAgePolicy) -> Self {
        self.max_age = max_age;
        self
    }

    /// The curator's limits.
    #[must_use]
    pub const fn config(&self) -> &CuratorConfig {
        &self.config
    }

    /// Builds a bundle from what is cached now.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for an invalid request.
    #[instrument(skip(self, request), fields(lat = request.location.lat, lng = request.location.lng, radius_km = request.radius_km))]
    pub async fn essential_data(&self, request: &EssentialRequest) -> Result<EssentialDataPackage> {
        request.validate()?;
        let now = self.clock.now();
        let mut package = EssentialDataPackage::new(request, now);
        for (data_type, _) in STEPS {
            self.collect(&mut package, request, data_type, now).await?;
        }
        package.finalize(&self.max_age);
        debug!(
            entries = package.len(),
            validity_hours = package.estimated_validity_hours,
            "Essential data assembled"
        );
        Ok(package)
    }

    async fn collect(
        &self,
        package: &mut EssentialDataPackage,
        request: &EssentialRequest,
        data_type: DataType,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(limits) = self.config.limits(data_type) else {
            return Ok(());
        };
        let mut entries = self
            .store
            .query(data_type, &request.filter(data_type), None)
            .await?
            .into_entries();

        if matches!(data_type, DataType::MandiInfo | DataType::Weather) {
            let distance = |e: &CacheEntry| {
                e.content
                    .location()
                    .map_or(f64::INFINITY, |l| request.location.distance_km(&l))
            };
            entries.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
        }
        entries.truncate(limits.max_entries);

        if entries.is_empty() {
            debug!(data_type = %data_type, "No cached data for section");
        }
        package.insert(data_type, entries, self.max_age.max_age(data_type), now);
        Ok(())
    }

    /// Starts a background job building the bundle for `request`.
    ///
    /// # Errors
    /// Returns [`CacheError::Validation`] for an invalid request.
    #[instrument(skip(self, request))]
    pub async fn prepare(self: &Arc<Self>, request: EssentialRequest) -> Result<Uuid> {
        request.validate()?;
        let id = Uuid::new_v4();
        let (state, _) = watch::channel(OfflinePreparation {
            id,
            request,
            status: PreparationStatus::Preparing,
            progress_percentage: 0.0,
            started_at: self.clock.now(),
            completed_at: None,
            data_size_bytes: 0,
            error: None,
        });
        let job = Arc::new(Job {
            state,
            cancelled: AtomicBool::new(false),
            package: OnceLock::new(),
        });
        self.jobs.write().await.insert(id, Arc::clone(&job));

        let curator = Arc::clone(self);
        tokio::spawn(async move { curator.run_job(id, job).await });
        info!(preparation_id = %id, "Offline preparation started");
        Ok(id)
    }

    async fn run_job(&self, id: Uuid, job: Arc<Job>) {
        let request = job.state.borrow().request.clone();
        let now = self.clock.now();
        let mut package = EssentialDataPackage::new(&request, now);
        let mut collected = 0;

        for (data_type, progress) in STEPS {
            if job.cancelled.load(Ordering::Acquire) {
                debug!(preparation_id = %id, sections = collected, "Preparation cancelled, stopping");
                break;
            }
            if let Err(err) = self.collect(&mut package, &request, data_type, now).await {
                warn!(preparation_id = %id, data_type = %data_type, error = %err, "Offline preparation failed");
                let at = self.clock.now();
                job.update(|state| {
                    state.status = PreparationStatus::Failed;
                    state.error = Some(err.to_string());
                    state.completed_at = Some(at);
                });
                return;
            }
            collected += 1;
            job.update(|state| state.progress_percentage = progress);
            tokio::task::yield_now().await;
        }

        package.finalize(&self.max_age);
        let size = package.size_bytes;
        if collected > 0 {
            let _ = job.package.set(package);
        }
        // The flag is only set under the state lock, so reading it here
        // decides the final status atomically with any cancel request.
        let at = self.clock.now();
        let mut status = PreparationStatus::Completed;
        job.update(|state| {
            if job.cancelled.load(Ordering::Acquire) {
                status = PreparationStatus::Cancelled;
            } else {
                state.progress_percentage = 100.0;
            }
            state.status = status;
            state.data_size_bytes = size;
            state.completed_at = Some(at);
        });
        match status {
            PreparationStatus::Cancelled => {
                info!(preparation_id = %id, sections = collected, size_bytes = size, "Offline preparation cancelled");
            }
            _ => info!(preparation_id = %id, size_bytes = size, "Offline preparation completed"),
        }
    }

    async fn job(&self, id: Uuid) -> Result<Arc<Job>> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(format!("preparation {id}")))
    }

    /// Current state of job `id`.
    ///
    /// # Errors
    /// Returns [`CacheError::NotFound`] for an unknown id.
    pub async fn status(&self, id: Uuid) -> Result<OfflinePreparation> {
        Ok(self.job(id).await?.state.borrow().clone())
    }

    /// The package of job `id` once it has finished.
    ///
    /// A cancelled job keeps the sections it collected; `None` while the job
    /// runs, after a failure, or if it was cancelled before any section.
    ///
    /// # Errors
    /// Returns [`CacheError::NotFound`] for an unknown id.
    pub async fn package(&self, id: Uuid) -> Result<Option<EssentialDataPackage>> {
        let job = self.job(id).await?;
        if !job.state.borrow().status.is_terminal() {
            return Ok(None);
        }
        Ok(job.package.get().cloned())
    }

    /// Stops job `id` from starting further sections.
    ///
    /// A section already being collected completes and is recorded; the job
    /// then ends CANCELLED. Returns false if the job had already finished.
    ///
    /// # Errors
    /// Returns [`CacheError::NotFound`] for an unknown id.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let job = self.job(id).await?;
        let mut requested = false;
        job.state.send_if_modified(|state| {
            if !state.status.is_terminal() {
                job.cancelled.store(true, Ordering::Release);
                requested = true;
            }
            false
        });
        if requested {
            info!(preparation_id = %id, "Offline preparation cancellation requested");
        }
        Ok(requested)
    }

    /// Waits until job `id` reaches a terminal status, up to `timeout`.
    ///
    /// # Errors
    /// - [`CacheError::NotFound`] for an unknown id.
    /// - [`CacheError::Timeout`] if the job is still running after `timeout`.
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Result<OfflinePreparation> {
        let mut state = self.job(id).await?.state.subscribe();
        let finished = tokio::time::timeout(timeout, state.wait_for(|s| s.status.is_terminal()))
            .await
            .map_err(|_| CacheError::Timeout {
                operation: format!("preparation {id}"),
                after: timeout,
            })?;
        match finished {
            Ok(s) => Ok(s.clone()),
            Err(_) => Err(CacheError::NotFound(format!("preparation {id}"))),
        }
    }

    /// Jobs still collecting data.
    pub async fn active_jobs(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| !job.state.borrow().status.is_terminal())
            .count()
    }

    /// Forgets finished jobs that ended more than `older_than` ago and
    /// returns their ids.
    pub async fn prune_finished(&self, older_than: Duration) -> Vec<Uuid> {
        let age = chrono::TimeDelta::from_std(older_than).unwrap_or(chrono::TimeDelta::MAX);
        let Some(cutoff) = self.clock.now().checked_sub_signed(age) else {
            return Vec::new();
        };
        let mut jobs = self.jobs.write().await;
        let pruned: Vec<Uuid> = jobs
            .iter()
            .filter(|(_, job)| job.state.borrow().completed_at.is_some_and(|at| at < cutoff))
            .map(|(id, _)| *id)
            .collect();
        for id in &pruned {
            jobs.remove(id);
        }
        if !pruned.is_empty() {
            debug!(pruned = pruned.len(), "Pruned finished preparations");
        }
        pruned
    }
}
