//! Row store backed by a PostgREST endpoint (Supabase `rest/v1`).

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::config::TableNames;
use crate::error::StoreError;
use crate::identity::IdentityKey;
use crate::model::{Participant, SessionRecord};
use crate::patch::SessionPatch;
use crate::row_store::{ParticipantPatch, RowStore};

const INSUFFICIENT_PRIVILEGE: &str = "42501";
const UNIQUE_VIOLATION: &str = "23505";

pub struct PostgrestRowStore {
    http: Client,
    rest_base: Url,
    api_key: String,
    access_token: RwLock<Option<String>>,
    tables: TableNames,
}

impl PostgrestRowStore {
    /// `project_url` is the project root, e.g. `https://abc.supabase.co`.
    pub fn new(
        project_url: &Url,
        api_key: impl Into<String>,
        tables: TableNames,
    ) -> Result<Self, StoreError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()
            .map_err(|err| StoreError::Backend(format!("http client: {err}")))?;
        let rest_base = project_url
            .join("rest/v1/")
            .map_err(|err| StoreError::Backend(format!("invalid project url: {err}")))?;
        Ok(Self {
            http,
            rest_base,
            api_key: api_key.into(),
            access_token: RwLock::new(None),
            tables,
        })
    }

    pub fn with_access_token(self, token: Option<String>) -> Self {
        *self.access_token.write() = token;
        self
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    fn table_url(&self, table: &str, filters: &[(&str, String)]) -> Result<Url, StoreError> {
        let mut url = self
            .rest_base
            .join(table)
            .map_err(|err| StoreError::Backend(format!("invalid table url: {err}")))?;
        if !filters.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (column, value) in filters {
                pairs.append_pair(column, value);
            }
        }
        Ok(url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self
            .access_token
            .read()
            .clone()
            .unwrap_or_else(|| self.api_key.clone());
        builder
            .header("apikey", self.api_key.as_str())
            .bearer_auth(token)
    }

    async fn read_rows<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<Vec<T>, StoreError> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn insert_row<T: Serialize + DeserializeOwned>(
        &self,
        table: &str,
        row: &T,
    ) -> Result<T, StoreError> {
        let url = self.table_url(table, &[])?;
        let builder = self
            .http
            .post(url)
            .header("Prefer", "return=representation")
            .json(row);
        self.read_rows::<T>(builder)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::WriteDenied(format!("insert into {table} returned no row")))
    }

    /// PostgREST filters rows RLS hides instead of failing, so an update that
    /// matches nothing is treated as denied.
    async fn patch_rows<P: Serialize>(
        &self,
        table: &str,
        id: &str,
        patch: &P,
    ) -> Result<(), StoreError> {
        let url = self.table_url(table, &[("id", eq(id))])?;
        let builder = self
            .http
            .patch(url)
            .header("Prefer", "return=representation")
            .json(patch);
        let rows = self.read_rows::<serde_json::Value>(builder).await?;
        if rows.is_empty() {
            return Err(StoreError::WriteDenied(format!("update of {table} {id} matched no rows")));
        }
        Ok(())
    }
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        StoreError::Network(err.to_string())
    } else if err.is_decode() {
        StoreError::Backend(format!("invalid response body: {err}"))
    } else {
        StoreError::Backend(err.to_string())
    }
}

/// Maps a PostgREST error response onto the store taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> StoreError {
    let code = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("code").and_then(|c| c.as_str()).map(str::to_string));
    let code = code.as_deref();
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || code == Some(INSUFFICIENT_PRIVILEGE)
    {
        StoreError::WriteDenied(format!("{status}: {body}"))
    } else if status == StatusCode::CONFLICT || code == Some(UNIQUE_VIOLATION) {
        StoreError::Conflict(format!("{status}: {body}"))
    } else if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::GATEWAY_TIMEOUT {
        StoreError::Network(format!("{status}: {body}"))
    } else {
        StoreError::Backend(format!("unexpected status {status}: {body}"))
    }
}

#[async_trait]
impl RowStore for PostgrestRowStore {
    async fn insert_session(&self, record: &SessionRecord) -> Result<SessionRecord, StoreError> {
        self.insert_row(&self.tables.sessions, record).await
    }

    async fn fetch_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let url = self.table_url(
            &self.tables.sessions,
            &[("id", eq(session_id)), ("select", "*".into())],
        )?;
        let rows = self.read_rows::<SessionRecord>(self.http.get(url)).await?;
        Ok(rows.into_iter().next())
    }

    async fn update_session(
        &self,
        session_id: &str,
        patch: &SessionPatch,
    ) -> Result<(), StoreError> {
        self.patch_rows(&self.tables.sessions, session_id, patch).await
    }

    async fn find_participant(
        &self,
        session_id: &str,
        key: &IdentityKey,
    ) -> Result<Option<Participant>, StoreError> {
        let url = self.table_url(
            &self.tables.participants,
            &[
                ("session_id", eq(session_id)),
                (key.column(), eq(key.value())),
                ("is_active", eq("true")),
                ("limit", "1".into()),
            ],
        )?;
        let rows = self.read_rows::<Participant>(self.http.get(url)).await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_participant(
        &self,
        participant: &Participant,
    ) -> Result<Participant, StoreError> {
        self.insert_row(&self.tables.participants, participant).await
    }

    async fn update_participant(
        &self,
        participant_id: &str,
        patch: &ParticipantPatch,
    ) -> Result<(), StoreError> {
        self.patch_rows(&self.tables.participants, participant_id, patch)
            .await
    }

    async fn list_participants(&self, session_id: &str) -> Result<Vec<Participant>, StoreError> {
        let url = self.table_url(
            &self.tables.participants,
            &[
                ("session_id", eq(session_id)),
                ("order", "joined_at.asc".into()),
            ],
        )?;
        self.read_rows::<Participant>(self.http.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PostgrestRowStore {
        let url = Url::parse("https://demo.supabase.co").unwrap();
        PostgrestRowStore::new(&url, "anon", TableNames::default()).unwrap()
    }

    #[test]
    fn filters_are_encoded_as_query_pairs() {
        let url = store()
            .table_url(
                "reading_session_participants",
                &[("session_id", eq("s 1")), ("limit", "1".into())],
            )
            .unwrap();
        assert_eq!(url.path(), "/rest/v1/reading_session_participants");
        assert_eq!(url.query(), Some("session_id=eq.s+1&limit=1"));
    }

    #[test]
    fn rls_failures_classify_as_write_denied() {
        assert!(classify_status(StatusCode::FORBIDDEN, "").is_write_denied());
        assert!(classify_status(StatusCode::UNAUTHORIZED, "{}").is_write_denied());
        let body = r#"{"code":"42501","message":"new row violates row-level security policy"}"#;
        assert!(classify_status(StatusCode::BAD_REQUEST, body).is_write_denied());
    }

    #[test]
    fn other_failures_keep_their_kind() {
        let dup = r#"{"code":"23505","message":"duplicate key"}"#;
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, dup),
            StoreError::Conflict(_)
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_network());
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            StoreError::Backend(_)
        ));
    }
}
