//! Axum + Askama dashboard for the diagnostic lead table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{FixedOffset, NaiveDate};
use diagdash_core::{
    CanonicalRecord, ChartKind, DashboardSummary, DerivedView, FilterSpec, Snapshot,
    ALL_CAMPAIGNS,
};
use diagdash_sync::{export, hub_from_config, RetrievalError, SnapshotHub, SyncConfig};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "diagdash-web";
pub const SESSION_COOKIE: &str = "diagdash_session";

const CHART_COLORS: [&str; 6] = ["#5170FF", "#7B93FF", "#A3B5FF", "#CCD7FF", "#3B5BDB", "#2E4BC4"];
const DEFAULT_PER_PAGE: usize = 50;

pub const MAX_MEMO_ENTRIES: usize = 64;
pub const MAX_SESSIONS: usize = 1024;
pub const SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Clone, Default, Deserialize)]
struct WebConfigFile {
    password: Option<String>,
    web_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub password: String,
}

impl WebConfig {
    /// `DIAGDASH_WEB_PORT` / `DIAGDASH_PASSWORD`, falling back to `diagdash.yaml`.
    pub fn load(workspace_root: &std::path::Path) -> anyhow::Result<Self> {
        let path = workspace_root.join(diagdash_sync::CONFIG_FILE_NAME);
        let file = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str::<WebConfigFile>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            WebConfigFile::default()
        };

        let port = match std::env::var("DIAGDASH_WEB_PORT") {
            Ok(v) => v
                .trim()
                .parse()
                .with_context(|| format!("DIAGDASH_WEB_PORT={v} is not a port"))?,
            Err(_) => file.web_port.unwrap_or(8000),
        };
        let password = std::env::var("DIAGDASH_PASSWORD")
            .ok()
            .or(file.password)
            .unwrap_or_default();
        if password.is_empty() {
            bail!("no dashboard password configured (set DIAGDASH_PASSWORD)");
        }
        Ok(Self { port, password })
    }
}

pub struct AppState {
    pub hub: SnapshotHub,
    pub utc_offset: FixedOffset,
    pub workspace_root: PathBuf,
    password_digest: String,
    sessions: Mutex<HashMap<String, Instant>>,
    summaries: Mutex<HashMap<(u64, FilterSpec), MemoEntry>>,
}

struct MemoEntry {
    summary: Arc<DashboardSummary>,
    last_used: Instant,
}

impl AppState {
    pub fn new(
        hub: SnapshotHub,
        password: &str,
        utc_offset: FixedOffset,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            hub,
            utc_offset,
            workspace_root: workspace_root.into(),
            password_digest: digest(password),
            sessions: Mutex::new(HashMap::new()),
            summaries: Mutex::new(HashMap::new()),
        }
    }

    pub fn password_matches(&self, candidate: &str) -> bool {
        digest(candidate) == self.password_digest
    }

    /// New session token. Expired sessions are pruned first; at `MAX_SESSIONS` the oldest
    /// session is dropped.
    pub async fn issue_session(&self) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, issued_at| issued_at.elapsed() <= SESSION_TTL);
        if sessions.len() >= MAX_SESSIONS {
            if let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, issued_at)| **issued_at)
                .map(|(token, _)| token.clone())
            {
                sessions.remove(&oldest);
            }
        }
        sessions.insert(token.clone(), Instant::now());
        token
    }

    pub async fn revoke_session(&self, token: &str) {
        self.sessions.lock().await.remove(token);
    }

    async fn is_authenticated(&self, headers: &HeaderMap) -> bool {
        match session_token(headers) {
            Some(token) => self
                .sessions
                .lock()
                .await
                .get(token)
                .is_some_and(|issued_at| issued_at.elapsed() <= SESSION_TTL),
            None => false,
        }
    }

    /// Summary for `(generation, filter)`, computed once per pair. Entries of older
    /// generations are dropped when a newer snapshot shows up; at most `MAX_MEMO_ENTRIES`
    /// are kept, evicting the least recently used.
    async fn summary_for(&self, snapshot: &Snapshot, spec: &FilterSpec) -> Arc<DashboardSummary> {
        let generation = snapshot.generation();
        let key = (generation, spec.clone());
        let mut memo = self.summaries.lock().await;
        memo.retain(|(cached_generation, _), _| *cached_generation == generation);

        if let Some(entry) = memo.get_mut(&key) {
            entry.last_used = Instant::now();
            return entry.summary.clone();
        }

        if memo.len() >= MAX_MEMO_ENTRIES {
            if let Some(victim) = memo
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            {
                memo.remove(&victim);
            }
        }
        let summary = Arc::new(diagdash_insights::summarize(snapshot, spec));
        memo.insert(
            key,
            MemoEntry {
                summary: summary.clone(),
                last_used: Instant::now(),
            },
        );
        summary
    }
}

fn digest(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, token)| token)
}

/// Query parameters shared by every filtered view. Empty form fields mean "unset".
///
/// The campaign is kept byte-for-byte so any value listed in the selector matches itself.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub campaign: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

impl FilterQuery {
    pub fn to_spec(&self, utc_offset: FixedOffset) -> Result<FilterSpec, String> {
        Ok(FilterSpec {
            start_date: parse_day(self.start.as_deref(), "start")?,
            end_date: parse_day(self.end.as_deref(), "end")?,
            campaign: self
                .campaign
                .as_deref()
                .filter(|c| !c.is_empty() && *c != ALL_CAMPAIGNS)
                .map(ToString::to_string),
            utc_offset,
        })
    }
}

fn parse_day(raw: Option<&str>, name: &str) -> Result<Option<NaiveDate>, String> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| format!("invalid {name} date `{value}`, expected YYYY-MM-DD")),
    }
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    password: String,
}

#[derive(Debug, Deserialize, Default)]
struct LoginQuery {
    failed: Option<bool>,
}

#[derive(Template)]
#[template(path = "login.html")]
struct LoginTemplate {
    failed: bool,
}

#[derive(Debug, Clone)]
struct CampaignOption {
    value: String,
    selected: bool,
}

#[derive(Debug, Clone)]
struct ChartPanel {
    slug: &'static str,
    title: &'static str,
    empty: bool,
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    total_records: usize,
    filtered_records: usize,
    synced_at: String,
    start: String,
    end: String,
    all_selected: bool,
    campaigns: Vec<CampaignOption>,
    charts: Vec<ChartPanel>,
}

/// Display strings for one table row; missing values render as `-`.
#[derive(Debug, Clone)]
struct RecordRow {
    name: String,
    phone: String,
    email: String,
    respondent_profile: String,
    age_bracket: String,
    familiarity: String,
    employment_status: String,
    salary_bracket: String,
    first_time_attendee: String,
    learning_gap: String,
    utm_campaign: String,
    utm_source: String,
    utm_medium: String,
    utm_content: String,
    created_at: String,
}

impl RecordRow {
    fn from_record(record: &CanonicalRecord, utc_offset: FixedOffset) -> Self {
        fn shown(value: Option<&str>) -> String {
            match value.map(str::trim) {
                Some(v) if !v.is_empty() => v.to_string(),
                _ => "-".to_string(),
            }
        }
        Self {
            name: shown(record.name.as_deref()),
            phone: shown(record.phone.as_deref()),
            email: shown(record.email.as_deref()),
            respondent_profile: shown(Some(&record.respondent_profile)),
            age_bracket: shown(Some(&record.age_bracket)),
            familiarity: shown(Some(&record.familiarity)),
            employment_status: shown(Some(&record.employment_status)),
            salary_bracket: shown(Some(&record.salary_bracket)),
            first_time_attendee: shown(Some(&record.first_time_attendee)),
            learning_gap: shown(Some(&record.learning_gap)),
            utm_campaign: shown(record.utm_campaign.as_deref()),
            utm_source: shown(record.utm_source.as_deref()),
            utm_medium: shown(record.utm_medium.as_deref()),
            utm_content: shown(record.utm_content.as_deref()),
            created_at: record
                .created_at
                .with_timezone(&utc_offset)
                .format("%d/%m/%Y %H:%M")
                .to_string(),
        }
    }
}

#[derive(Template)]
#[template(path = "records_table_partial.html")]
struct RecordsTablePartialTemplate {
    rows: Vec<RecordRow>,
    filtered_records: usize,
    page: usize,
    total_pages: usize,
    prev_page: usize,
    next_page: usize,
    per_page: usize,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    message: String,
}

pub fn app(state: AppState) -> Router {
    router(Arc::new(state))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/login", get(login_page_handler).post(login_handler))
        .route("/logout", post(logout_handler))
        .route("/records/table", get(records_table_handler))
        .route("/charts/{kind}", get(chart_handler))
        .route("/summary", get(summary_handler))
        .route("/export.csv", get(export_csv_handler))
        .route("/refresh", post(refresh_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let sync_config = SyncConfig::from_env()?;
    let web_config = WebConfig::load(&sync_config.workspace_root)?;
    let hub = hub_from_config(&sync_config)?;
    let state = AppState::new(
        hub,
        &web_config.password,
        sync_config.utc_offset,
        sync_config.workspace_root.clone(),
    );
    let listener = TcpListener::bind(("0.0.0.0", web_config.port)).await?;
    info!(port = web_config.port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn login_page_handler(Query(query): Query<LoginQuery>) -> Response {
    render_html(LoginTemplate {
        failed: query.failed.unwrap_or(false),
    })
}

async fn login_handler(State(state): State<Arc<AppState>>, Form(form): Form<LoginForm>) -> Response {
    if !state.password_matches(&form.password) {
        warn!("rejected dashboard login");
        let mut resp = render_html(LoginTemplate { failed: true });
        *resp.status_mut() = StatusCode::UNAUTHORIZED;
        return resp;
    }
    let token = state.issue_session().await;
    let cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict");
    with_cookie(Redirect::to("/").into_response(), &cookie)
}

async fn logout_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        state.revoke_session(token).await;
    }
    let cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0");
    with_cookie(Redirect::to("/login").into_response(), &cookie)
}

async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FilterQuery>,
) -> Response {
    if !state.is_authenticated(&headers).await {
        return Redirect::to("/login").into_response();
    }
    let spec = match query.to_spec(state.utc_offset) {
        Ok(spec) => spec,
        Err(message) => return bad_request(message),
    };
    let snapshot = match state.hub.get_or_sync().await {
        Ok(snapshot) => snapshot,
        Err(err) => return retrieval_failed(err),
    };
    let summary = state.summary_for(&snapshot, &spec).await;

    let selected = spec.campaign_constraint();
    let campaigns = summary
        .campaigns
        .iter()
        .map(|value| CampaignOption {
            selected: selected == Some(value.as_str()),
            value: value.clone(),
        })
        .collect();
    let charts = ChartKind::ALL
        .into_iter()
        .map(|kind| ChartPanel {
            slug: kind.slug(),
            title: kind.title(),
            empty: summary.view(kind).map_or(true, DerivedView::is_empty),
        })
        .collect();

    render_html(DashboardTemplate {
        total_records: summary.total_records,
        filtered_records: summary.filtered_records,
        synced_at: snapshot
            .synced_at()
            .with_timezone(&state.utc_offset)
            .format("%d/%m/%Y %H:%M")
            .to_string(),
        start: query.start.clone().unwrap_or_default(),
        end: query.end.clone().unwrap_or_default(),
        all_selected: selected.is_none(),
        campaigns,
        charts,
    })
}

async fn records_table_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FilterQuery>,
) -> Response {
    let (snapshot, spec) = match authorized_snapshot(&state, &headers, &query).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let filtered = diagdash_insights::apply_filter(snapshot.records(), &spec);

    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).max(1);
    let total_pages = filtered.len().max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let rows = filtered
        .iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(|record| RecordRow::from_record(record, state.utc_offset))
        .collect();

    let mut resp = render_html(RecordsTablePartialTemplate {
        rows,
        filtered_records: filtered.len(),
        page,
        total_pages,
        prev_page: page.saturating_sub(1).max(1),
        next_page: (page + 1).min(total_pages),
        per_page,
    });
    resp.headers_mut().insert(
        header::HeaderName::from_static("hx-trigger"),
        HeaderValue::from_static("recordsTableLoaded"),
    );
    resp
}

async fn chart_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(kind): AxumPath<String>,
    Query(query): Query<FilterQuery>,
) -> Response {
    let Ok(kind) = kind.parse::<ChartKind>() else {
        return (StatusCode::NOT_FOUND, Html(format!("unknown chart `{kind}`"))).into_response();
    };
    let (snapshot, spec) = match authorized_snapshot(&state, &headers, &query).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let summary = state.summary_for(&snapshot, &spec).await;
    match summary.view(kind) {
        Some(view) => Json(plotly_figure(view)).into_response(),
        None => (StatusCode::NOT_FOUND, Html(format!("no view for `{kind}`"))).into_response(),
    }
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FilterQuery>,
) -> Response {
    let (snapshot, spec) = match authorized_snapshot(&state, &headers, &query).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let summary = state.summary_for(&snapshot, &spec).await;
    Json(summary.as_ref().clone()).into_response()
}

async fn export_csv_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FilterQuery>,
) -> Response {
    let (snapshot, spec) = match authorized_snapshot(&state, &headers, &query).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let filtered = diagdash_insights::apply_filter(snapshot.records(), &spec);
    match export::csv_bytes(&filtered) {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"diagnostico_cnc.csv\"",
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !state.is_authenticated(&headers).await {
        return Redirect::to("/login").into_response();
    }
    match state.hub.refresh().await {
        Ok(snapshot) => {
            info!(generation = snapshot.generation(), records = snapshot.len(), "snapshot refreshed");
            Redirect::to("/").into_response()
        }
        Err(err) => retrieval_failed(err),
    }
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response(),
    }
}

/// Session check, filter parsing and snapshot access for the data endpoints.
async fn authorized_snapshot(
    state: &AppState,
    headers: &HeaderMap,
    query: &FilterQuery,
) -> Result<(Arc<Snapshot>, FilterSpec), Response> {
    if !state.is_authenticated(headers).await {
        return Err((StatusCode::UNAUTHORIZED, "login required").into_response());
    }
    let spec = query.to_spec(state.utc_offset).map_err(bad_request)?;
    let snapshot = state.hub.get_or_sync().await.map_err(retrieval_failed)?;
    Ok((snapshot, spec))
}

/// Plotly figure for one view: ranked ads as horizontal bars, age as vertical bars,
/// the two shares as pies.
pub fn plotly_figure(view: &DerivedView) -> serde_json::Value {
    let labels = view.buckets.iter().map(|b| b.label.clone()).collect::<Vec<_>>();
    let counts = view.buckets.iter().map(|b| b.count).collect::<Vec<_>>();
    let trace = match view.kind {
        ChartKind::AdPerformance => json!({
            "type": "bar",
            "orientation": "h",
            "x": counts,
            "y": labels,
            "customdata": view.buckets.iter().map(|b| b.original_label.clone()).collect::<Vec<_>>(),
            "hovertemplate": "%{customdata}: %{x}<extra></extra>",
            "marker": {"color": CHART_COLORS[0]}
        }),
        ChartKind::AgeBracket => json!({
            "type": "bar",
            "x": labels,
            "y": counts,
            "marker": {"color": CHART_COLORS[0]}
        }),
        ChartKind::Source | ChartKind::EmploymentStatus => json!({
            "type": "pie",
            "labels": labels,
            "values": counts,
            "marker": {"colors": CHART_COLORS}
        }),
    };
    let mut layout = json!({
        "title": view.kind.title(),
        "paper_bgcolor": "#ffffff",
        "plot_bgcolor": "#f8fafc"
    });
    if view.kind == ChartKind::AdPerformance {
        layout["yaxis"] = json!({"autorange": "reversed"});
    }
    json!({ "data": [trace], "layout": layout })
}

fn with_cookie(mut resp: Response, cookie: &str) -> Response {
    match HeaderValue::from_str(cookie) {
        Ok(value) => {
            resp.headers_mut().append(header::SET_COOKIE, value);
            resp
        }
        Err(err) => server_error(anyhow::anyhow!(err)),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Html(message)).into_response()
}

fn retrieval_failed(err: RetrievalError) -> Response {
    warn!(error = %err, "dashboard data unavailable");
    let mut resp = render_html(ErrorTemplate {
        message: err.to_string(),
    });
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Offset;
    use diagdash_core::RawRecord;
    use diagdash_storage::MemoryStore;
    use diagdash_sync::{Synchronizer, WindowConfig};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const PASSWORD: &str = "segredo-de-teste";

    fn row(id: &str, created_at: &str, campaign: Option<&str>, content: Option<&str>) -> RawRecord {
        match json!({
            "id": id,
            "created_at": created_at,
            "name": "Maria",
            "utm_campaign": campaign,
            "utm_source": "instagram",
            "utm_content": content,
            "Qual a sua idade": "25 a 34 anos",
        }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn rows() -> Vec<RawRecord> {
        vec![
            row("r1", "2026-02-20T10:00:00Z", Some("jornada-fev"), Some("reels-torno")),
            row("r2", "2026-02-19T10:00:00Z", Some("jornada-fev"), Some("reels-torno")),
            row("r3", "2026-02-18T10:00:00Z", Some("jornada-jan"), None),
        ]
    }

    fn state_with(store: MemoryStore) -> Arc<AppState> {
        let hub = SnapshotHub::new(Synchronizer::new(Arc::new(store), WindowConfig::default()));
        let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        Arc::new(AppState::new(hub, PASSWORD, chrono::Utc.fix(), workspace_root))
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::COOKIE, format!("{SESSION_COOKIE}={token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn pages_redirect_to_login_without_a_session() {
        let app = router(state_with(MemoryStore::new(rows())));
        let resp = app.oneshot(get("/", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers()[header::LOCATION], "/login");
    }

    #[tokio::test]
    async fn data_endpoints_reject_missing_sessions() {
        let state = state_with(MemoryStore::new(rows()));
        let app = router(state);
        for uri in ["/summary", "/charts/ads", "/records/table", "/export.csv"] {
            let resp = app.clone().oneshot(get(uri, Some("forged"))).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    #[tokio::test]
    async fn login_sets_an_http_only_session_cookie() {
        let state = state_with(MemoryStore::new(rows()));
        let app = router(state.clone());

        let wrong = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("password=nope"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert!(body_text(wrong).await.contains("Senha incorreta"));

        let ok = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(format!("password={PASSWORD}")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::SEE_OTHER);
        let cookie = ok.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with(&format!("{SESSION_COOKIE}=")));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));

        let token = cookie
            .split(';')
            .next()
            .and_then(|pair| pair.split_once('='))
            .map(|(_, token)| token.to_string())
            .unwrap();
        assert!(state.sessions.lock().await.contains_key(&token));
    }

    #[tokio::test]
    async fn dashboard_renders_for_an_authenticated_session() {
        let state = state_with(MemoryStore::new(rows()));
        let token = state.issue_session().await;
        let resp = router(state).oneshot(get("/", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Dashboard de Diagnóstico"));
        assert!(text.contains("jornada-jan"));
    }

    #[tokio::test]
    async fn summary_applies_campaign_and_date_filters() {
        let state = state_with(MemoryStore::new(rows()));
        let token = state.issue_session().await;
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(get("/summary?campaign=jornada-fev", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary: DashboardSummary = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.filtered_records, 2);
        assert_eq!(summary.campaigns, vec!["jornada-fev", "jornada-jan"]);

        let resp = app
            .oneshot(get("/summary?start=2026-02-19&end=2026-02-19&campaign=all", Some(&token)))
            .await
            .unwrap();
        let summary: DashboardSummary = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(summary.filtered_records, 1);
    }

    #[tokio::test]
    async fn bad_dates_are_rejected() {
        let state = state_with(MemoryStore::new(rows()));
        let token = state.issue_session().await;
        let resp = router(state)
            .oneshot(get("/summary?start=19/02/2026", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chart_json_has_plotly_shape() {
        let state = state_with(MemoryStore::new(rows()));
        let token = state.issue_session().await;
        let app = router(state);

        let resp = app.clone().oneshot(get("/charts/ads", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        let figure: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(figure["data"][0]["type"], "bar");
        assert_eq!(figure["data"][0]["y"], json!(["reels-torno", "Sem anúncio"]));
        assert_eq!(figure["data"][0]["x"], json!([2, 1]));

        let resp = app.clone().oneshot(get("/charts/source", Some(&token))).await.unwrap();
        let figure: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(figure["data"][0]["type"], "pie");

        let resp = app.oneshot(get("/charts/pie", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn export_csv_has_canonical_header() {
        let state = state_with(MemoryStore::new(rows()));
        let token = state.issue_session().await;
        let resp = router(state)
            .oneshot(get("/export.csv?campaign=jornada-jan", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        let mut lines = text.lines();
        assert!(lines
            .next()
            .unwrap()
            .starts_with("id,created_at,name,phone,email,utm_campaign,utm_source"));
        assert_eq!(lines.count(), 1);
    }

    #[tokio::test]
    async fn table_partial_sets_htmx_trigger() {
        let state = state_with(MemoryStore::new(rows()));
        let token = state.issue_session().await;
        let resp = router(state)
            .oneshot(get("/records/table?per_page=2", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["hx-trigger"], "recordsTableLoaded");
        let text = body_text(resp).await;
        assert!(text.contains("20/02/2026 10:00"));
        assert!(!text.contains("18/02/2026 10:00"));
    }

    #[tokio::test]
    async fn retrieval_failure_renders_terminal_error_page() {
        let state = state_with(MemoryStore::new(rows()).failing_at_offset(0));
        let token = state.issue_session().await;
        let resp = router(state.clone()).oneshot(get("/", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(body_text(resp).await.contains("action=\"/refresh\""));
        assert!(state.hub.current().await.is_none());
    }

    #[tokio::test]
    async fn logout_revokes_the_session() {
        let state = state_with(MemoryStore::new(rows()));
        let token = state.issue_session().await;
        let resp = router(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/logout")
                    .header(header::COOKIE, format!("{SESSION_COOKIE}={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert!(!state.sessions.lock().await.contains_key(&token));
    }

    #[tokio::test]
    async fn summaries_are_memoized_per_generation() {
        let state = state_with(MemoryStore::new(rows()));
        let snapshot = state.hub.get_or_sync().await.unwrap();
        let spec = FilterSpec::default();
        let a = state.summary_for(&snapshot, &spec).await;
        let b = state.summary_for(&snapshot, &spec).await;
        assert!(Arc::ptr_eq(&a, &b));

        let newer = state.hub.refresh().await.unwrap();
        let c = state.summary_for(&newer, &spec).await;
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(state.summaries.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn campaigns_with_surrounding_whitespace_match_exactly() {
        let mut rows = rows();
        rows.push(row("r4", "2026-02-17T10:00:00Z", Some("jornada "), None));
        let state = state_with(MemoryStore::new(rows));
        let token = state.issue_session().await;

        let resp = router(state)
            .oneshot(get("/summary?campaign=jornada%20", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary: DashboardSummary = serde_json::from_str(&body_text(resp).await).unwrap();
        assert!(summary.campaigns.contains(&"jornada ".to_string()));
        assert_eq!(summary.filtered_records, 1);
    }

    #[tokio::test]
    async fn summary_memo_stays_bounded_within_a_generation() {
        let state = state_with(MemoryStore::new(rows()));
        let snapshot = state.hub.get_or_sync().await.unwrap();
        for i in 0..500 {
            let spec = FilterSpec {
                campaign: Some(format!("campanha-{i}")),
                ..FilterSpec::default()
            };
            state.summary_for(&snapshot, &spec).await;
        }
        assert_eq!(state.summaries.lock().await.len(), MAX_MEMO_ENTRIES);

        // the most recent spec survives eviction
        let latest = FilterSpec {
            campaign: Some("campanha-499".into()),
            ..FilterSpec::default()
        };
        let key = (snapshot.generation(), latest);
        assert!(state.summaries.lock().await.contains_key(&key));
    }

    #[tokio::test]
    async fn session_store_is_capped() {
        let state = state_with(MemoryStore::new(rows()));
        let first = state.issue_session().await;
        std::thread::sleep(Duration::from_millis(5));
        for _ in 0..MAX_SESSIONS + 10 {
            state.issue_session().await;
        }
        let sessions = state.sessions.lock().await;
        assert_eq!(sessions.len(), MAX_SESSIONS);
        assert!(!sessions.contains_key(&first));
    }

    #[tokio::test]
    async fn css_asset_is_served() {
        let app = router(state_with(MemoryStore::new(rows())));
        let resp = app.oneshot(get("/assets/static/app.css", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
