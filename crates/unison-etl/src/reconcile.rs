//! Duplicate analysis over the projection.
//!
//! A [`Reconciler`] holds one snapshot of projection rows and answers every
//! report from it: per-record weights, pairwise overlap, the deduplicated
//! record list that feeds write-back, and the dry-run summary shown before
//! any write. All reports are pure and deterministic; maps are ordered so
//! serialized output is byte-stable for unchanged input.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;

use unison_core::model::{CollectionId, ProjectedRecord, RecordId};
use unison_core::schema::{Database, ProjectionFilter};

use crate::error::SyncResult;

/// Which rows a report covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    All,
    Collection(CollectionId),
}

impl Scope {
    pub fn includes(&self, row: &ProjectedRecord) -> bool {
        match self {
            Self::All => true,
            Self::Collection(id) => &row.collection_source == id,
        }
    }
}

impl From<Option<CollectionId>> for Scope {
    fn from(collection: Option<CollectionId>) -> Self {
        collection.map_or(Self::All, Self::Collection)
    }
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// A record with the number of times it occurs in a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeightedRecord {
    pub record_id: RecordId,
    pub name: Option<String>,
    pub primary_artist: Option<String>,
    pub album: Option<String>,
    pub weight: u64,
    pub first_added: Option<String>,
    pub last_added: Option<String>,
    pub presence_by_collection: BTreeMap<CollectionId, u64>,
}

/// One distinct record of the merged library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeduplicatedRecord {
    pub record_id: RecordId,
    pub name: Option<String>,
    pub primary_artist: Option<String>,
    pub album: Option<String>,
    pub first_added: Option<String>,
    pub total_occurrences: u64,
    pub presence_by_collection: BTreeMap<CollectionId, u64>,
}

/// Distinct-id overlap between two collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlapReport {
    pub collection_a: CollectionId,
    pub collection_b: CollectionId,
    pub only_a: u64,
    pub only_b: u64,
    pub in_both: u64,
    pub shared: Vec<RecordId>,
}

/// Entry and distinct counts of one collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionSummary {
    pub collection_source: CollectionId,
    pub entries: u64,
    pub unique: u64,
    pub duplicates: u64,
    pub duplicate_pct: f64,
}

/// Per-collection summaries plus library-wide totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibrarySummary {
    pub collections: Vec<CollectionSummary>,
    pub total_entries: u64,
    pub unique_tracks: u64,
    pub duplicates: u64,
    pub duplicate_pct: f64,
}

/// Entries and distinct ids added in one month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineBucket {
    /// `YYYY-MM`
    pub month: String,
    pub entries: u64,
    pub unique: u64,
    /// `entries / unique`; values well above 1 mark bursts of re-adds.
    pub ratio: f64,
}

/// Aggregate facts over distinct tracks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LibraryStats {
    pub unique_tracks: u64,
    pub unique_artists: u64,
    pub unique_albums: u64,
    pub total_duration_ms: i64,
    pub avg_duration_ms: Option<i64>,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub avg_popularity: Option<f64>,
    pub explicit_tracks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtistCount {
    pub artist: Option<String>,
    pub artist_id: Option<String>,
    pub unique_tracks: u64,
    pub total_entries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearCount {
    pub year: i32,
    pub tracks: u64,
}

/// Weight statistics of the designated weighted scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightStats {
    pub scope: Scope,
    pub entries: u64,
    pub distinct: u64,
    pub highest: u64,
    /// Mean weight per distinct record, rounded to 2 decimals.
    pub mean: f64,
    /// Distinct records with weight above 1.
    pub with_duplicates: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BeforeCounts {
    pub entries_by_collection: BTreeMap<CollectionId, u64>,
    pub total_entries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AfterCounts {
    pub unique_tracks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Impact {
    pub duplicates_removed: u64,
    pub reduction_pct: f64,
}

/// Read-only report of what a merge would do.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunSummary {
    pub before: BeforeCounts,
    pub after: AfterCounts,
    pub impact: Impact,
    pub overlap: Option<OverlapReport>,
    pub weight_stats: WeightStats,
}

/// Knobs for [`Reconciler::dry_run_summary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryOptions {
    pub weighted_scope: Scope,
    /// Pair to compare; defaults to the only two collections when exactly
    /// two are present.
    pub overlap_pair: Option<(CollectionId, CollectionId)>,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            weighted_scope: Scope::All,
            overlap_pair: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Reports over one snapshot of the projection.
#[derive(Debug, Clone)]
pub struct Reconciler {
    rows: Vec<ProjectedRecord>,
}

impl Reconciler {
    pub fn new(rows: Vec<ProjectedRecord>) -> Self {
        Self { rows }
    }

    /// Snapshot the whole projection.
    pub fn load(db: &Database) -> SyncResult<Self> {
        Ok(Self::new(db.query_projection(&ProjectionFilter::all())?))
    }

    pub fn rows(&self) -> &[ProjectedRecord] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Collections present in the snapshot.
    pub fn collections(&self) -> BTreeSet<&CollectionId> {
        self.rows.iter().map(|r| &r.collection_source).collect()
    }

    fn scoped<'a>(&'a self, scope: &'a Scope) -> impl Iterator<Item = &'a ProjectedRecord> + 'a {
        self.rows.iter().filter(move |row| scope.includes(row))
    }

    fn aggregate(&self, scope: &Scope) -> BTreeMap<&RecordId, Aggregate<'_>> {
        let mut aggregates: BTreeMap<&RecordId, Aggregate<'_>> = BTreeMap::new();
        for row in self.rows.iter().filter(|row| scope.includes(row)) {
            aggregates
                .entry(&row.record_id)
                .and_modify(|agg| agg.add(row))
                .or_insert_with(|| Aggregate::new(row));
        }
        aggregates
    }

    /// Occurrence count of every record in `scope`, heaviest first.
    ///
    /// Weights sum to the number of rows in scope.
    pub fn weight_report(&self, scope: &Scope) -> Vec<WeightedRecord> {
        let mut report: Vec<WeightedRecord> = self
            .aggregate(scope)
            .into_values()
            .map(|agg| WeightedRecord {
                record_id: agg.representative.record_id.clone(),
                name: agg.representative.name.clone(),
                primary_artist: agg.representative.primary_artist.clone(),
                album: agg.representative.album.clone(),
                weight: agg.weight,
                first_added: agg.earliest.raw().map(str::to_string),
                last_added: agg.last_added().map(str::to_string),
                presence_by_collection: agg.presence,
            })
            .collect();

        report.sort_by(|a, b| {
            b.weight
                .cmp(&a.weight)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        report
    }

    /// Distinct-id overlap between collections `a` and `b`.
    pub fn overlap_report(&self, a: &CollectionId, b: &CollectionId) -> OverlapReport {
        let ids_of = |collection: &CollectionId| -> BTreeSet<&RecordId> {
            self.rows
                .iter()
                .filter(|row| &row.collection_source == collection)
                .map(|row| &row.record_id)
                .collect()
        };
        let set_a = ids_of(a);
        let set_b = ids_of(b);
        let shared: Vec<RecordId> = set_a.intersection(&set_b).map(|id| (*id).clone()).collect();
        let in_both = shared.len() as u64;

        OverlapReport {
            collection_a: a.clone(),
            collection_b: b.clone(),
            only_a: set_a.len() as u64 - in_both,
            only_b: set_b.len() as u64 - in_both,
            in_both,
            shared,
        }
    }

    /// One record per id across every collection, earliest-added first.
    ///
    /// Undated records follow all dated ones; ties fall back to the id.
    /// Metadata is taken from each record's earliest occurrence.
    pub fn deduplicate(&self) -> Vec<DeduplicatedRecord> {
        let mut aggregates: Vec<Aggregate<'_>> = self.aggregate(&Scope::All).into_values().collect();
        aggregates.sort_by(|a, b| {
            a.earliest
                .cmp(&b.earliest)
                .then_with(|| a.representative.record_id.cmp(&b.representative.record_id))
        });

        aggregates
            .into_iter()
            .map(|agg| DeduplicatedRecord {
                record_id: agg.representative.record_id.clone(),
                name: agg.representative.name.clone(),
                primary_artist: agg.representative.primary_artist.clone(),
                album: agg.representative.album.clone(),
                first_added: agg.earliest.raw().map(str::to_string),
                total_occurrences: agg.weight,
                presence_by_collection: agg.presence,
            })
            .collect()
    }

    /// Ids of [`Self::deduplicate`], in order.
    pub fn deduplicated_ids(&self) -> Vec<RecordId> {
        self.deduplicate().into_iter().map(|r| r.record_id).collect()
    }

    /// Everything a merge would change, without changing anything.
    pub fn dry_run_summary(&self, options: &SummaryOptions) -> DryRunSummary {
        let mut entries_by_collection: BTreeMap<CollectionId, u64> = BTreeMap::new();
        for row in &self.rows {
            *entries_by_collection
                .entry(row.collection_source.clone())
                .or_default() += 1;
        }
        let total_entries = self.rows.len() as u64;
        let unique_tracks = self.aggregate(&Scope::All).len() as u64;
        let duplicates_removed = total_entries - unique_tracks;

        let overlap = match &options.overlap_pair {
            Some((a, b)) => Some(self.overlap_report(a, b)),
            None => {
                let collections: Vec<&CollectionId> = entries_by_collection.keys().collect();
                match collections.as_slice() {
                    [a, b] => Some(self.overlap_report(a, b)),
                    _ => None,
                }
            }
        };

        DryRunSummary {
            before: BeforeCounts {
                entries_by_collection,
                total_entries,
            },
            after: AfterCounts { unique_tracks },
            impact: Impact {
                duplicates_removed,
                reduction_pct: percent(duplicates_removed, total_entries),
            },
            overlap,
            weight_stats: self.weight_stats(&options.weighted_scope),
        }
    }

    /// Weight statistics of `scope`.
    pub fn weight_stats(&self, scope: &Scope) -> WeightStats {
        let aggregates = self.aggregate(scope);
        let entries: u64 = aggregates.values().map(|agg| agg.weight).sum();
        let distinct = aggregates.len() as u64;

        WeightStats {
            scope: scope.clone(),
            entries,
            distinct,
            highest: aggregates.values().map(|agg| agg.weight).max().unwrap_or(0),
            mean: ratio(entries, distinct),
            with_duplicates: aggregates.values().filter(|agg| agg.weight > 1).count() as u64,
        }
    }

    /// Entry, distinct and duplicate counts per collection and overall.
    pub fn collection_summary(&self) -> LibrarySummary {
        let mut collections = Vec::new();
        for collection in self.collections() {
            let scope = Scope::Collection(collection.clone());
            let entries = self.scoped(&scope).count() as u64;
            let unique = self.aggregate(&scope).len() as u64;
            collections.push(CollectionSummary {
                collection_source: collection.clone(),
                entries,
                unique,
                duplicates: entries - unique,
                duplicate_pct: percent(entries - unique, entries),
            });
        }

        let total_entries = self.rows.len() as u64;
        let unique_tracks = self.aggregate(&Scope::All).len() as u64;
        LibrarySummary {
            collections,
            total_entries,
            unique_tracks,
            duplicates: total_entries - unique_tracks,
            duplicate_pct: percent(total_entries - unique_tracks, total_entries),
        }
    }

    /// How many distinct records appear in exactly `k` collections.
    pub fn presence_distribution(&self) -> BTreeMap<usize, u64> {
        let mut distribution = BTreeMap::new();
        for agg in self.aggregate(&Scope::All).values() {
            *distribution.entry(agg.presence.len()).or_default() += 1;
        }
        distribution
    }

    /// Records present in more than one collection, most widespread first.
    pub fn shared_tracks(&self) -> Vec<DeduplicatedRecord> {
        let mut shared: Vec<DeduplicatedRecord> = self
            .deduplicate()
            .into_iter()
            .filter(|r| r.presence_by_collection.len() > 1)
            .collect();
        shared.sort_by(|a, b| {
            b.presence_by_collection
                .len()
                .cmp(&a.presence_by_collection.len())
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        shared
    }

    /// Monthly add counts of `scope`; undated rows are left out.
    pub fn timeline(&self, scope: &Scope) -> Vec<TimelineBucket> {
        let mut buckets: BTreeMap<String, (u64, BTreeSet<&RecordId>)> = BTreeMap::new();
        for row in self.scoped(scope) {
            let Some(month) = month_of(row.added_at.as_deref()) else {
                continue;
            };
            let bucket = buckets.entry(month).or_default();
            bucket.0 += 1;
            bucket.1.insert(&row.record_id);
        }

        buckets
            .into_iter()
            .map(|(month, (entries, ids))| {
                let unique = ids.len() as u64;
                TimelineBucket {
                    month,
                    entries,
                    unique,
                    ratio: ratio(entries, unique),
                }
            })
            .collect()
    }

    /// Duration, popularity and catalog breadth over distinct tracks.
    pub fn library_stats(&self) -> LibraryStats {
        let aggregates = self.aggregate(&Scope::All);
        if aggregates.is_empty() {
            return LibraryStats::default();
        }

        let tracks: Vec<&ProjectedRecord> = aggregates.values().map(|agg| agg.representative).collect();
        let artists: BTreeSet<&str> = tracks
            .iter()
            .filter_map(|t| t.primary_artist_id.as_deref().or(t.primary_artist.as_deref()))
            .collect();
        let albums: BTreeSet<&str> = tracks
            .iter()
            .filter_map(|t| t.album_id.as_deref().or(t.album.as_deref()))
            .collect();
        let durations: Vec<i64> = tracks.iter().filter_map(|t| t.duration_ms).collect();
        let popularity: Vec<i64> = tracks.iter().filter_map(|t| t.popularity).collect();
        let duration_sum: i128 = durations.iter().map(|&d| i128::from(d)).sum();

        LibraryStats {
            unique_tracks: tracks.len() as u64,
            unique_artists: artists.len() as u64,
            unique_albums: albums.len() as u64,
            total_duration_ms: saturate(duration_sum),
            avg_duration_ms: i128::try_from(durations.len())
                .ok()
                .filter(|n| *n > 0)
                .map(|n| saturate(duration_sum / n)),
            min_duration_ms: durations.iter().copied().min(),
            max_duration_ms: durations.iter().copied().max(),
            avg_popularity: mean_of(&popularity),
            explicit_tracks: tracks.iter().filter(|t| t.explicit).count() as u64,
        }
    }

    /// Artists by number of distinct tracks, then by entries.
    pub fn top_artists(&self, limit: usize) -> Vec<ArtistCount> {
        let mut by_artist: BTreeMap<(Option<&str>, Option<&str>), (BTreeSet<&RecordId>, u64)> =
            BTreeMap::new();
        for row in &self.rows {
            let key = (row.primary_artist.as_deref(), row.primary_artist_id.as_deref());
            let counts = by_artist.entry(key).or_default();
            counts.0.insert(&row.record_id);
            counts.1 += 1;
        }

        let mut artists: Vec<ArtistCount> = by_artist
            .into_iter()
            .map(|((artist, artist_id), (ids, entries))| ArtistCount {
                artist: artist.map(str::to_string),
                artist_id: artist_id.map(str::to_string),
                unique_tracks: ids.len() as u64,
                total_entries: entries,
            })
            .collect();
        artists.sort_by(|a, b| {
            b.unique_tracks
                .cmp(&a.unique_tracks)
                .then_with(|| b.total_entries.cmp(&a.total_entries))
                .then_with(|| a.artist.cmp(&b.artist))
        });
        artists.truncate(limit);
        artists
    }

    /// Distinct tracks per release year, newest year first.
    pub fn release_years(&self) -> Vec<YearCount> {
        let mut years: BTreeMap<i32, u64> = BTreeMap::new();
        for agg in self.aggregate(&Scope::All).values() {
            if let Some(year) = agg.representative.release_year() {
                *years.entry(year).or_default() += 1;
            }
        }
        years
            .into_iter()
            .rev()
            .map(|(year, tracks)| YearCount { year, tracks })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Sort key for `added_at`: parsed instants first, then unparseable text,
/// then missing values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum AddedAt {
    Dated(DateTime<Utc>, String),
    Undated(String),
    Missing,
}

impl AddedAt {
    fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::Missing;
        };
        match parse_timestamp(raw) {
            Some(instant) => Self::Dated(instant, raw.to_string()),
            None => Self::Undated(raw.to_string()),
        }
    }

    fn raw(&self) -> Option<&str> {
        match self {
            Self::Dated(_, raw) | Self::Undated(raw) => Some(raw),
            Self::Missing => None,
        }
    }
}

struct Aggregate<'a> {
    representative: &'a ProjectedRecord,
    earliest: AddedAt,
    latest_dated: Option<AddedAt>,
    weight: u64,
    presence: BTreeMap<CollectionId, u64>,
}

impl<'a> Aggregate<'a> {
    fn new(row: &'a ProjectedRecord) -> Self {
        let added = AddedAt::parse(row.added_at.as_deref());
        let latest_dated = matches!(added, AddedAt::Dated(..)).then(|| added.clone());
        Self {
            representative: row,
            earliest: added,
            latest_dated,
            weight: 1,
            presence: BTreeMap::from([(row.collection_source.clone(), 1)]),
        }
    }

    fn add(&mut self, row: &'a ProjectedRecord) {
        let added = AddedAt::parse(row.added_at.as_deref());

        if matches!(added, AddedAt::Dated(..))
            && self.latest_dated.as_ref().map_or(true, |latest| &added > latest)
        {
            self.latest_dated = Some(added.clone());
        }
        if added < self.earliest {
            self.earliest = added;
            self.representative = row;
        }

        self.weight += 1;
        *self
            .presence
            .entry(row.collection_source.clone())
            .or_default() += 1;
    }

    fn last_added(&self) -> Option<&str> {
        self.latest_dated
            .as_ref()
            .and_then(AddedAt::raw)
            .or_else(|| self.earliest.raw())
    }
}

/// Parse an `added_at` value: RFC 3339, `YYYY-MM-DD HH:MM:SS`, or a bare
/// date (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(instant.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn month_of(added_at: Option<&str>) -> Option<String> {
    let raw = added_at?.trim();
    match parse_timestamp(raw) {
        Some(instant) => Some(instant.format("%Y-%m").to_string()),
        None => raw
            .get(..7)
            .filter(|prefix| prefix.as_bytes().get(4) == Some(&b'-'))
            .map(str::to_string),
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    round2(numerator as f64 / denominator as f64)
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(part as f64 * 100.0 / whole as f64)
}

#[allow(clippy::cast_precision_loss)]
fn mean_of(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum: i128 = values.iter().map(|&v| i128::from(v)).sum();
    Some(round2(sum as f64 / values.len() as f64))
}

/// Clamp a wide sum back into `i64`.
fn saturate(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// `H:MM:SS` for an hour or more, otherwise `M:SS`.
pub fn format_duration(ms: i64) -> String {
    let seconds = ms.max(0) / 1000;
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

/// `Xh Ym`
pub fn format_total_duration(ms: i64) -> String {
    let ms = ms.max(0);
    format!("{}h {}m", ms / 3_600_000, (ms % 3_600_000) / 60_000)
}
