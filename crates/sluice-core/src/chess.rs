//! Chess.com source: player profiles, archive index, monthly games and
//! online status.
//!
//! `players_games` is the incremental resource. It walks the archive index of
//! every player, keeps the monthly pages inside the configured range, skips
//! pages already checkpointed and fetches the rest through the deferred
//! engine, emitting games in discovery order.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};

use crate::deferred::DeferredEngine;
use crate::error::AppError;
use crate::models::{Record, ResourceMeta, ResourceStats, WriteDisposition};
use crate::range::MonthRange;
use crate::resource::{ExtractContext, Resource};
use crate::runner::RunEvent;
use crate::source::Source;
use crate::traits::{CheckpointBackend, RecordSink, Upstream};

pub const SOURCE_NAME: &str = "chess";
pub const OFFICIAL_API_URL: &str = "https://api.chess.com/pub/";
pub const CALLBACK_API_URL: &str = "https://www.chess.com/callback/";

pub const PROFILES: &str = "players_profiles";
pub const ARCHIVES: &str = "players_archives";
pub const GAMES: &str = "players_games";
pub const ONLINE_STATUS: &str = "players_online_status";

/// Parameters of the chess source.
#[derive(Debug, Clone)]
pub struct ChessConfig {
    pub players: Vec<String>,
    /// Inclusive lower bound of archive months, `YYYY/MM`.
    pub start_month: Option<String>,
    /// Inclusive upper bound of archive months, `YYYY/MM`.
    pub end_month: Option<String>,
    pub api_url: String,
    pub callback_url: String,
}

impl ChessConfig {
    pub fn new<S: Into<String>>(players: impl IntoIterator<Item = S>) -> Self {
        Self {
            players: players.into_iter().map(Into::into).collect(),
            start_month: None,
            end_month: None,
            api_url: OFFICIAL_API_URL.to_string(),
            callback_url: CALLBACK_API_URL.to_string(),
        }
    }

    pub fn with_months(mut self, start: Option<&str>, end: Option<&str>) -> Self {
        self.start_month = start.map(str::to_string);
        self.end_month = end.map(str::to_string);
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = url.into();
        self
    }

    fn api(&self, path: &str) -> String {
        join_url(&self.api_url, path)
    }

    fn callback(&self, path: &str) -> String {
        join_url(&self.callback_url, path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Assemble the chess source. Pure: no request is made.
pub fn compose(config: ChessConfig) -> Result<Source<ChessResource>, AppError> {
    if config.players.iter().any(|p| p.trim().is_empty()) {
        return Err(AppError::ValidationError(
            "player names must not be empty".into(),
        ));
    }

    let config = Arc::new(config);
    let archives = Arc::new(PlayersArchives {
        meta: ResourceMeta::new(ARCHIVES, WriteDisposition::Replace).deselected(),
        config: Arc::clone(&config),
    });

    Source::new(
        SOURCE_NAME,
        vec![
            ChessResource::Profiles(Arc::new(PlayersProfiles {
                meta: ResourceMeta::new(PROFILES, WriteDisposition::Replace),
                config: Arc::clone(&config),
            })),
            ChessResource::Archives(Arc::clone(&archives)),
            ChessResource::Games(Arc::new(PlayersGames {
                meta: ResourceMeta::new(GAMES, WriteDisposition::Append).depends_on(ARCHIVES),
                config: Arc::clone(&config),
                archives,
            })),
            ChessResource::OnlineStatus(Arc::new(PlayersOnlineStatus {
                meta: ResourceMeta::new(ONLINE_STATUS, WriteDisposition::Append),
                config,
            })),
        ],
    )
}

/// The resources of the chess source.
#[derive(Debug, Clone)]
pub enum ChessResource {
    Profiles(Arc<PlayersProfiles>),
    Archives(Arc<PlayersArchives>),
    Games(Arc<PlayersGames>),
    OnlineStatus(Arc<PlayersOnlineStatus>),
}

impl Resource for ChessResource {
    fn meta(&self) -> &ResourceMeta {
        match self {
            Self::Profiles(r) => &r.meta,
            Self::Archives(r) => &r.meta,
            Self::Games(r) => &r.meta,
            Self::OnlineStatus(r) => &r.meta,
        }
    }

    async fn extract<U, B, S>(
        &self,
        ctx: &mut ExtractContext<'_, U, B>,
        sink: &mut S,
    ) -> Result<ResourceStats, AppError>
    where
        U: Upstream,
        B: CheckpointBackend,
        S: RecordSink,
    {
        match self {
            Self::Profiles(r) => r.extract(ctx, sink).await,
            Self::Archives(r) => r.extract(ctx, sink).await,
            Self::Games(r) => r.extract(ctx, sink).await,
            Self::OnlineStatus(r) => r.extract(ctx, sink).await,
        }
    }
}

fn into_record(url: &str, body: Value) -> Result<Record, AppError> {
    match body {
        Value::Object(map) => Ok(map),
        other => Err(AppError::malformed_payload(
            url,
            format!("expected a JSON object, got {}", json_kind(&other)),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PlayersProfiles {
    meta: ResourceMeta,
    config: Arc<ChessConfig>,
}

impl PlayersProfiles {
    async fn extract<U, B, S>(
        &self,
        ctx: &mut ExtractContext<'_, U, B>,
        sink: &mut S,
    ) -> Result<ResourceStats, AppError>
    where
        U: Upstream,
        B: CheckpointBackend,
        S: RecordSink,
    {
        let mut stats = ResourceStats::new(&self.meta.name);
        let mut engine = DeferredEngine::new(ctx.concurrency);

        for player in &self.config.players {
            ctx.ensure_active()?;
            stats.candidates += 1;

            let url = self.config.api(&format!("player/{player}"));
            ctx.reporter.report(RunEvent::TaskSubmitted {
                resource: &self.meta.name,
                item: &url,
            });
            let upstream = ctx.upstream.clone();
            engine.submit(async move {
                let body = upstream.fetch(&url).await?;
                into_record(&url, body)
            });
            stats.tasks_submitted += 1;
        }

        while let Some(result) = engine.next().await {
            let record = result?;
            ctx.emit(&self.meta, sink, vec![record], &mut stats).await?;
        }

        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Archives
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PlayersArchives {
    meta: ResourceMeta,
    config: Arc<ChessConfig>,
}

impl PlayersArchives {
    /// Monthly archive URLs of `player`, in the order the index lists them.
    pub async fn player_archives<U: Upstream>(
        &self,
        upstream: &U,
        player: &str,
    ) -> Result<Vec<String>, AppError> {
        let url = self.config.api(&format!("player/{player}/games/archives"));
        let body = upstream.fetch(&url).await?;

        let Some(archives) = body.get("archives") else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = archives else {
            return Err(AppError::malformed_payload(&url, "'archives' is not a list"));
        };

        items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    AppError::malformed_payload(&url, "archive entry is not a string")
                })
            })
            .collect()
    }

    async fn extract<U, B, S>(
        &self,
        ctx: &mut ExtractContext<'_, U, B>,
        sink: &mut S,
    ) -> Result<ResourceStats, AppError>
    where
        U: Upstream,
        B: CheckpointBackend,
        S: RecordSink,
    {
        let mut stats = ResourceStats::new(&self.meta.name);

        for player in &self.config.players {
            ctx.ensure_active()?;
            let archives = self.player_archives(ctx.upstream, player).await?;
            stats.candidates += archives.len();

            let records = archives
                .into_iter()
                .map(|archive_url| {
                    let mut record = Record::new();
                    record.insert("player".into(), Value::String(player.clone()));
                    record.insert("archive_url".into(), Value::String(archive_url));
                    record
                })
                .collect::<Vec<_>>();
            if !records.is_empty() {
                ctx.emit(&self.meta, sink, records, &mut stats).await?;
            }
        }

        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Games
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PlayersGames {
    meta: ResourceMeta,
    config: Arc<ChessConfig>,
    archives: Arc<PlayersArchives>,
}

/// Games listed on one monthly archive page.
fn games_from_page(url: &str, page: Value) -> Result<Vec<Record>, AppError> {
    let games = match page {
        Value::Object(mut map) => map.remove("games"),
        other => {
            return Err(AppError::malformed_payload(
                url,
                format!("expected a JSON object, got {}", json_kind(&other)),
            ));
        }
    };

    match games {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => map,
                other => {
                    let mut record = Record::new();
                    record.insert("value".into(), other);
                    record
                }
            })
            .collect()),
        Some(_) => Err(AppError::malformed_payload(url, "'games' is not a list")),
    }
}

impl PlayersGames {
    async fn extract<U, B, S>(
        &self,
        ctx: &mut ExtractContext<'_, U, B>,
        sink: &mut S,
    ) -> Result<ResourceStats, AppError>
    where
        U: Upstream,
        B: CheckpointBackend,
        S: RecordSink,
    {
        // Bounds are checked before any request is made.
        let range = MonthRange::parse(
            self.config.start_month.as_deref(),
            self.config.end_month.as_deref(),
        )?;

        let name = self.meta.name.as_str();
        let mut stats = ResourceStats::new(name);
        let mut engine: DeferredEngine<(String, Vec<Record>)> =
            DeferredEngine::new(ctx.concurrency);

        for player in &self.config.players {
            ctx.ensure_active()?;
            let pages = self.archives.player_archives(ctx.upstream, player).await?;

            for url in pages {
                stats.candidates += 1;

                if !range.contains(&url) {
                    stats.filtered_out += 1;
                    ctx.reporter.report(RunEvent::ItemFiltered {
                        resource: name,
                        item: &url,
                    });
                    continue;
                }

                if ctx.checkpoints.has(name, &url) {
                    stats.skipped += 1;
                    ctx.reporter.report(RunEvent::ItemSkipped {
                        resource: name,
                        item: &url,
                    });
                    continue;
                }

                ctx.checkpoints.mark_processed(name, &url);
                ctx.reporter.report(RunEvent::TaskSubmitted {
                    resource: name,
                    item: &url,
                });
                let upstream = ctx.upstream.clone();
                engine.submit(async move {
                    let page = upstream.fetch(&url).await?;
                    let games = games_from_page(&url, page)?;
                    Ok((url, games))
                });
                stats.tasks_submitted += 1;
            }
        }

        while let Some(result) = engine.next().await {
            let (url, games) = result?;
            if !games.is_empty() {
                ctx.emit(&self.meta, sink, games, &mut stats).await?;
            }
            ctx.checkpoints.commit(name, &url);
            ctx.ensure_active()?;
        }

        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Online status
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PlayersOnlineStatus {
    meta: ResourceMeta,
    config: Arc<ChessConfig>,
}

impl PlayersOnlineStatus {
    async fn extract<U, B, S>(
        &self,
        ctx: &mut ExtractContext<'_, U, B>,
        sink: &mut S,
    ) -> Result<ResourceStats, AppError>
    where
        U: Upstream,
        B: CheckpointBackend,
        S: RecordSink,
    {
        let mut stats = ResourceStats::new(&self.meta.name);

        for player in &self.config.players {
            ctx.ensure_active()?;
            stats.candidates += 1;

            let url = self.config.callback(&format!("user/popup/{player}"));
            let body = ctx.upstream.fetch(&url).await?;
            let field = |key: &str| {
                body.get(key)
                    .cloned()
                    .ok_or_else(|| AppError::malformed_payload(&url, format!("missing '{key}'")))
            };

            let record = json!({
                "username": player,
                "onlineStatus": field("onlineStatus")?,
                "lastLoginDate": field("lastLoginDate")?,
                "check_time": Utc::now().to_rfc3339(),
            });
            let record = into_record(&url, record)?;
            ctx.emit(&self.meta, sink, vec![record], &mut stats).await?;
        }

        Ok(stats)
    }
}
