//! JSON REST API over articles and user accounts.

mod error;

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use blogwire_core::{Article, NewArticle, TelegramSettings};
use blogwire_storage::{
    sqlite_article_store, ArticleFilter, ArticleStore, ArticleUpdate, Database, NewUser, Profile,
    StoreError, User, UserStore, UserUpdate,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use error::ApiError;

pub const CRATE_NAME: &str = "blogwire-web";

const DEFAULT_PER_PAGE: i64 = 10;
const MAX_PER_PAGE: i64 = 100;

/// Receives freshly issued password reset links. Mail delivery plugs in here.
pub trait ResetLinkSink: Send + Sync {
    fn deliver(&self, user: &User, link_path: &str);
}

/// Writes the link to the log.
pub struct LogResetLinks;

impl ResetLinkSink for LogResetLinks {
    fn deliver(&self, user: &User, link_path: &str) {
        info!(user_id = user.id, link = link_path, "password reset link issued");
    }
}

#[derive(Clone)]
pub struct AppState {
    pub articles: ArticleStore,
    pub users: UserStore,
    pub reset_links: Arc<dyn ResetLinkSink>,
}

impl AppState {
    pub fn new(db: &Database, telegram: TelegramSettings) -> Self {
        Self {
            articles: sqlite_article_store(db, telegram),
            users: UserStore::new(db.clone()),
            reset_links: Arc::new(LogResetLinks),
        }
    }

    pub fn with_reset_links(mut self, sink: Arc<dyn ResetLinkSink>) -> Self {
        self.reset_links = sink;
        self
    }
}

/// Caller resolved from `Authorization: Token <key>`.
pub struct AuthUser {
    pub user: User,
    pub token: String,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Token "))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ApiError::Unauthorized(
                "Authentication credentials were not provided.",
            ))?;

        match state.users.user_for_token(token).await? {
            Some(user) => Ok(Self {
                user,
                token: token.to_string(),
            }),
            None => Err(ApiError::Unauthorized("Invalid token.")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    email: String,
    password: String,
    username: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize, Default)]
struct ProfileBody {
    username: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResetRequestBody {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Deserialize)]
struct ResetConfirmBody {
    new_password: String,
    confirmed_password: String,
}

#[derive(Debug, Deserialize)]
struct ImageBody {
    #[serde(default)]
    image: String,
}

#[derive(Debug, Deserialize)]
struct PictureBody {
    #[serde(default)]
    picture: String,
}

#[derive(Debug, Deserialize, Default)]
struct ArticlesQuery {
    title: Option<String>,
    page: Option<i64>,
    per_page: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CreateArticleBody {
    title: String,
    #[serde(default)]
    content: String,
    picture: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct UpdateArticleBody {
    title: Option<String>,
    content: Option<String>,
    picture: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProfileView {
    id: i64,
    image: Option<String>,
}

impl From<Profile> for ProfileView {
    fn from(profile: Profile) -> Self {
        Self {
            id: profile.id,
            image: profile.image,
        }
    }
}

#[derive(Debug, Serialize)]
struct UserView {
    #[serde(flatten)]
    user: User,
    profile: Option<ProfileView>,
}

/// Profile as returned by the create/update endpoints; `user` is the full name.
#[derive(Debug, Serialize)]
struct OwnedProfileView {
    id: i64,
    user: String,
    image: Option<String>,
}

#[derive(Debug, Serialize)]
struct AuthorView {
    id: i64,
    username: String,
    full_name: String,
}

#[derive(Debug, Serialize)]
struct ArticleView {
    #[serde(flatten)]
    article: Article,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<AuthorView>,
}

#[derive(Debug, Serialize)]
struct ArticlePage {
    count: i64,
    page: i64,
    per_page: i64,
    total_pages: i64,
    results: Vec<Article>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/users/register", post(register_handler))
        .route("/api/users/login", post(login_handler))
        .route("/api/users/logout", post(logout_handler))
        .route(
            "/api/users/password/reset/request",
            post(reset_request_handler),
        )
        .route(
            "/api/users/password/reset/confirm/{uid}/{token}",
            put(reset_confirm_handler),
        )
        .route("/api/users/me", get(me_handler).patch(update_me_handler))
        .route("/api/users/me/profile-create", post(create_profile_handler))
        .route(
            "/api/users/me/{pk}/profile-update",
            put(update_profile_handler),
        )
        .route(
            "/api/articles",
            get(list_articles_handler).post(create_article_handler),
        )
        .route(
            "/api/articles/{id}",
            get(article_detail_handler)
                .put(replace_article_handler)
                .patch(update_article_handler)
                .delete(delete_article_handler),
        )
        .route(
            "/api/articles/{id}/upload-picture",
            post(upload_picture_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("BLOGWIRE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://blogwire.db?mode=rwc".to_string());

    let db = Database::connect(&database_url).await?;
    db.migrate().await?;
    let state = AppState::new(&db, TelegramSettings::from_env());

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .users
        .create_user(NewUser {
            email: body.email,
            password: body.password,
            username: body.username,
            first_name: body.first_name,
            last_name: body.last_name,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(user) = state.users.authenticate(&body.email, &body.password).await? else {
        return Err(ApiError::BadRequest(
            "Unable to log in with provided credentials.".into(),
        ));
    };
    let token = state.users.issue_token(user.id).await?;
    Ok(Json(json!({ "token": token })))
}

async fn logout_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.users.revoke_token(&auth.token).await?;
    info!(user_id = auth.user.id, "user logged out");
    Ok(Json(json!({ "message": "You have logged out successfully!" })))
}

async fn reset_request_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResetRequestBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let email = body.email.trim();
    if email.is_empty() {
        return Err(ApiError::BadRequest("Email is required.".into()));
    }

    let (user, token) = match state.users.issue_reset_token(email).await {
        Ok(issued) => issued,
        Err(StoreError::NotFound(_)) => {
            return Err(ApiError::NotFound("User with this email does not exist."))
        }
        Err(err) => return Err(err.into()),
    };
    let link = format!("/api/users/password/reset/confirm/{}/{token}", user.id);
    state.reset_links.deliver(&user, &link);
    Ok(Json(json!({
        "detail": "Password reset link has been sent to your email address."
    })))
}

async fn reset_confirm_handler(
    State(state): State<Arc<AppState>>,
    Path((uid, token)): Path<(String, String)>,
    Json(body): Json<ResetConfirmBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.new_password != body.confirmed_password {
        return Err(ApiError::BadRequest(
            "New password and confirmed password do not match.".into(),
        ));
    }
    let Ok(user_id) = uid.parse::<i64>() else {
        return Err(ApiError::BadRequest("Invalid UID or token.".into()));
    };

    state
        .users
        .confirm_password_reset(user_id, &token, &body.new_password)
        .await?;
    Ok(Json(json!({ "detail": "Password reset successfully." })))
}

async fn user_view(state: &AppState, user: User) -> Result<UserView, ApiError> {
    let profile = state.users.profile_for(user.id).await?.map(ProfileView::from);
    Ok(UserView { user, profile })
}

async fn me_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<UserView>, ApiError> {
    Ok(Json(user_view(&state, auth.user).await?))
}

fn require_image(image: &str) -> Result<&str, ApiError> {
    let image = image.trim();
    if image.is_empty() {
        return Err(ApiError::BadRequest("Image reference is required.".into()));
    }
    Ok(image)
}

async fn create_profile_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<ImageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let image = require_image(&body.image)?;
    let profile = state.users.create_profile(auth.user.id, image).await?;
    Ok((
        StatusCode::CREATED,
        Json(OwnedProfileView {
            id: profile.id,
            user: auth.user.full_name(),
            image: profile.image,
        }),
    ))
}

async fn update_profile_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(pk): Path<i64>,
    Json(body): Json<ImageBody>,
) -> Result<Json<OwnedProfileView>, ApiError> {
    let image = require_image(&body.image)?;
    let profile = state.users.update_profile(auth.user.id, pk, image).await?;
    Ok(Json(OwnedProfileView {
        id: profile.id,
        user: auth.user.full_name(),
        image: profile.image,
    }))
}

async fn update_me_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<ProfileBody>,
) -> Result<Json<UserView>, ApiError> {
    let user = state
        .users
        .update(
            auth.user.id,
            UserUpdate {
                username: body.username,
                first_name: body.first_name,
                last_name: body.last_name,
                password: body.password,
            },
        )
        .await?;
    Ok(Json(user_view(&state, user).await?))
}

async fn list_articles_handler(
    State(state): State<Arc<AppState>>,
    _auth: AuthUser,
    Query(query): Query<ArticlesQuery>,
) -> Result<Json<ArticlePage>, ApiError> {
    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    let page = query.page.unwrap_or(1).max(1);
    let title = query.title.filter(|t| !t.trim().is_empty());

    let mut filter = ArticleFilter {
        title,
        limit: None,
        offset: 0,
    };
    let count = state.articles.count(&filter).await?;
    let total_pages = ((count + per_page - 1) / per_page).max(1);
    if page > total_pages {
        return Err(ApiError::NotFound("Not found."));
    }

    filter.limit = Some(per_page);
    filter.offset = (page - 1) * per_page;
    let results = state.articles.list(&filter).await?;
    Ok(Json(ArticlePage {
        count,
        page,
        per_page,
        total_pages,
        results,
    }))
}

async fn create_article_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreateArticleBody>,
) -> Result<impl IntoResponse, ApiError> {
    let title = body.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("Title may not be blank.".into()));
    }

    let mut new = NewArticle::manual(auth.user.id, title, body.content);
    new.picture = body.picture;
    let article = match state.articles.create(new).await {
        Ok(article) => article,
        // The row is committed; only the announcement is missing.
        Err(StoreError::NotificationEnqueue { article, source }) => {
            error!(article_id = article.id, error = %source, "article created without notification");
            *article
        }
        Err(err) => return Err(err.into()),
    };
    Ok((StatusCode::CREATED, Json(article)))
}

async fn load_article(state: &AppState, id: i64) -> Result<Article, ApiError> {
    state.articles.get(id).await?.ok_or(ApiError::NotFound("Not found."))
}

fn ensure_author(article: &Article, user: &User) -> Result<(), ApiError> {
    match article.author_id() {
        Some(author_id) if author_id == user.id => Ok(()),
        Some(_) => Err(ApiError::Forbidden(
            "You do not have permission to perform this action.",
        )),
        None => Err(ApiError::Forbidden("Scraped articles are read-only.")),
    }
}

async fn article_detail_handler(
    State(state): State<Arc<AppState>>,
    _auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<ArticleView>, ApiError> {
    let article = load_article(&state, id).await?;
    let author = match article.author_id() {
        Some(author_id) => state.users.get(author_id).await?.map(|u| AuthorView {
            id: u.id,
            full_name: u.full_name(),
            username: u.username,
        }),
        None => None,
    };
    Ok(Json(ArticleView { article, author }))
}

async fn replace_article_handler(
    state: State<Arc<AppState>>,
    auth: AuthUser,
    id: Path<i64>,
    Json(body): Json<UpdateArticleBody>,
) -> Result<Json<Article>, ApiError> {
    if body.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
        return Err(ApiError::BadRequest("Title may not be blank.".into()));
    }
    update_article_handler(state, auth, id, Json(body)).await
}

async fn update_article_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<UpdateArticleBody>,
) -> Result<Json<Article>, ApiError> {
    let article = load_article(&state, id).await?;
    ensure_author(&article, &auth.user)?;
    if body.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(ApiError::BadRequest("Title may not be blank.".into()));
    }

    let updated = state
        .articles
        .update_manual(
            id,
            ArticleUpdate {
                title: body.title.map(|t| t.trim().to_string()),
                content: body.content,
                picture: body.picture,
            },
        )
        .await?;
    Ok(Json(updated))
}

async fn upload_picture_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<PictureBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let article = load_article(&state, id).await?;
    ensure_author(&article, &auth.user)?;
    let picture = body.picture.trim();
    if picture.is_empty() {
        return Err(ApiError::BadRequest("Picture reference is required.".into()));
    }

    let updated = state.articles.set_picture(id, picture).await?;
    Ok(Json(json!({ "id": updated.id, "picture": updated.picture })))
}

async fn delete_article_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let article = load_article(&state, id).await?;
    ensure_author(&article, &auth.user)?;
    state.articles.delete(id).await?;
    info!(article_id = id, user_id = auth.user.id, "article deleted");
    Ok(StatusCode::NO_CONTENT)
}
