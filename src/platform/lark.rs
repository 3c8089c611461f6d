use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::LarkConfig;
use crate::identity::{IdentityProfile, RemoteIdentityApi};
use crate::platform::MessageSender;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Refresh the tenant token this long before Lark says it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Thin client for the Lark open platform REST API.
pub struct LarkClient {
    client: reqwest::Client,
    config: LarkConfig,
    token: Mutex<Option<CachedToken>>,
    bot_open_id: RwLock<Option<String>>,
    departments: RwLock<HashMap<String, String>>,
}

/// Every Lark response carries `code`/`msg`; `data` holds the payload on success.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self, op: &str) -> Result<T> {
        if self.code != 0 {
            anyhow::bail!("{} error: code={}, msg={}", op, self.code, self.msg);
        }
        self.data
            .with_context(|| format!("{} error: response without data", op))
    }
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    app_id: &'a str,
    app_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    receive_id: &'a str,
    msg_type: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendData {
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct BotInfoResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    bot: Option<BotInfo>,
}

#[derive(Debug, Deserialize)]
struct BotInfo {
    #[serde(default)]
    open_id: String,
    #[serde(default)]
    app_name: String,
}

#[derive(Debug, Deserialize)]
struct UserData {
    user: RemoteUser,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RemoteUser {
    union_id: String,
    user_id: String,
    name: String,
    en_name: String,
    avatar: Option<Avatar>,
    description: String,
    email: String,
    city: String,
    job_title: String,
    work_station: String,
    employee_no: String,
    gender: i32,
    leader_user_id: String,
    department_ids: Vec<String>,
    join_time: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Avatar {
    avatar_origin: String,
}

#[derive(Debug, Deserialize)]
struct DepartmentData {
    department: Department,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Department {
    name: String,
}

impl LarkClient {
    pub fn new(config: LarkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            config,
            token: Mutex::new(None),
            bot_open_id: RwLock::new(None),
            departments: RwLock::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// The bot's own open id, once [`fetch_bot_info`](Self::fetch_bot_info) succeeded.
    pub fn bot_open_id(&self) -> Option<String> {
        self.bot_open_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn tenant_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let response: TokenResponse = self
            .client
            .post(self.url("/open-apis/auth/v3/tenant_access_token/internal"))
            .json(&TokenRequest {
                app_id: &self.config.app_id,
                app_secret: &self.config.app_secret,
            })
            .send()
            .await
            .context("Failed to request tenant access token")?
            .json()
            .await
            .context("Failed to parse tenant access token response")?;

        if response.code != 0 {
            anyhow::bail!(
                "tenant access token error: code={}, msg={}",
                response.code,
                response.msg
            );
        }

        let lifetime = Duration::from_secs(response.expire).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: response.tenant_access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        debug!("Refreshed tenant access token (expires in {}s)", response.expire);
        Ok(response.tenant_access_token)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, op: &str) -> Result<T> {
        let token = self.tenant_token().await?;
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("{} failed", op))?;
        parse_response(response, op).await
    }

    /// Send a message to a chat. Returns the new message id.
    pub async fn send_message(
        &self,
        chat_id: &str,
        msg_type: &str,
        content: &str,
    ) -> Result<String> {
        let token = self.tenant_token().await?;
        let response = self
            .client
            .post(self.url("/open-apis/im/v1/messages"))
            .query(&[("receive_id_type", "chat_id")])
            .bearer_auth(token)
            .json(&SendRequest {
                receive_id: chat_id,
                msg_type,
                content,
            })
            .send()
            .await
            .context("send message failed")?;
        let data: SendData = parse_response(response, "send message").await?;
        Ok(data.message_id)
    }

    /// Look up the bot's own identity so mentions of it can be detected.
    pub async fn fetch_bot_info(&self) -> Result<String> {
        let token = self.tenant_token().await?;
        let response: BotInfoResponse = self
            .client
            .get(self.url("/open-apis/bot/v3/info"))
            .bearer_auth(token)
            .send()
            .await
            .context("get bot info failed")?
            .json()
            .await
            .context("parse bot info failed")?;

        if response.code != 0 {
            anyhow::bail!("get bot info error: code={}, msg={}", response.code, response.msg);
        }
        let bot = response
            .bot
            .filter(|b| !b.open_id.is_empty())
            .context("bot info without open_id")?;

        info!("Bot info loaded: {} ({})", bot.app_name, bot.open_id);
        *self
            .bot_open_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(bot.open_id.clone());
        Ok(bot.open_id)
    }

    /// Department display name. Failed lookups cache the id itself so they aren't retried.
    async fn department_name(&self, department_id: &str) -> String {
        if department_id.is_empty() || department_id == "0" {
            return String::new();
        }
        if let Some(name) = self
            .departments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(department_id)
        {
            return name.clone();
        }

        let path = format!(
            "/open-apis/contact/v3/departments/{}?department_id_type=open_department_id",
            department_id
        );
        let name = match self.get::<DepartmentData>(&path, "get department").await {
            Ok(data) if !data.department.name.is_empty() => data.department.name,
            Ok(_) => department_id.to_string(),
            Err(e) => {
                debug!("Department lookup failed for {}: {:#}", department_id, e);
                department_id.to_string()
            }
        };

        self.departments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(department_id.to_string(), name.clone());
        name
    }
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response, op: &str) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("{} failed: unreadable body", op))?;
    let envelope: Envelope<T> = serde_json::from_str(&body)
        .with_context(|| format!("{} failed ({}): {}", op, status, body))?;
    envelope.into_data(op)
}

#[async_trait]
impl MessageSender for LarkClient {
    async fn send(
        &self,
        chat_id: &str,
        kind: &str,
        content: &str,
        _source: &str,
    ) -> Result<String> {
        self.send_message(chat_id, kind, content).await
    }
}

#[async_trait]
impl RemoteIdentityApi for LarkClient {
    async fn fetch(&self, open_id: &str) -> Result<IdentityProfile> {
        let path = format!(
            "/open-apis/contact/v3/users/{}?user_id_type=open_id&department_id_type=open_department_id",
            open_id
        );
        let data: UserData = self.get(&path, "get user info").await?;
        let user = data.user;

        let mut department_names = Vec::with_capacity(user.department_ids.len());
        for id in &user.department_ids {
            let name = self.department_name(id).await;
            if !name.is_empty() {
                department_names.push(name);
            }
        }

        Ok(IdentityProfile {
            open_id: open_id.to_string(),
            union_id: user.union_id,
            user_id: user.user_id,
            name: user.name,
            en_name: user.en_name,
            avatar: user.avatar.map(|a| a.avatar_origin).unwrap_or_default(),
            description: user.description,
            email: user.email,
            city: user.city,
            job_title: user.job_title,
            work_station: user.work_station,
            employee_no: user.employee_no,
            gender: user.gender,
            leader_user_id: user.leader_user_id,
            department_ids: user.department_ids,
            department_names,
            join_time: user.join_time,
        })
    }
}
