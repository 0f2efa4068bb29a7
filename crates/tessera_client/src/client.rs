//! The client: identity, room operations and sync-loop ownership.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use url::Url;

use tessera_storage::Storage;

use crate::config::SyncOptions;
use crate::error::{ClientError, ClientResult};
use crate::http::HttpClient;
use crate::request::{Method, Request, Response};
use crate::sync::{SyncContext, SyncTask, run_sync_loop};

/// Handler invoked with every error the sync loop encounters.
///
/// Called zero or more times over a client's lifetime; the loop keeps
/// running regardless. The handler must not block for long, since it runs
/// inside the loop between iterations.
pub type SyncErrorHandler = Arc<dyn Fn(ClientError) + Send + Sync>;

/// A client for one device on a homeserver.
///
/// Identity (user id, device id, access token, homeserver) is immutable for
/// the client's lifetime; the storage handle is the only shared mutable
/// state and serializes all mutations through its transactions. Operations
/// may run concurrently with each other and with the sync loop.
///
/// A client that has successfully [logged out](Client::log_out) refuses all
/// further operations.
pub struct Client {
    user_id: String,
    device_id: String,
    access_token: String,
    homeserver: Url,
    storage: Arc<dyn Storage>,
    http: Arc<dyn HttpClient>,
    options: SyncOptions,
    sync_error_handler: Arc<RwLock<Option<SyncErrorHandler>>>,
    sync_task: Mutex<Option<SyncTask>>,
    logged_out: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("homeserver", &self.homeserver.as_str())
            .field("logged_out", &self.logged_out)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client from existing credentials. No I/O is performed.
    ///
    /// Fails if `homeserver` is not a well-formed absolute http(s) URI.
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        access_token: impl Into<String>,
        homeserver: &str,
        storage: Arc<dyn Storage>,
        http: Arc<dyn HttpClient>,
    ) -> ClientResult<Self> {
        Ok(Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            access_token: access_token.into(),
            homeserver: parse_homeserver(homeserver)?,
            storage,
            http,
            options: SyncOptions::default(),
            sync_error_handler: Arc::new(RwLock::new(None)),
            sync_task: Mutex::new(None),
            logged_out: AtomicBool::new(false),
        })
    }

    /// Logs in with a password and builds a client from the returned
    /// credentials. This is the only path that produces credentials; it
    /// does not start the sync loop.
    pub async fn log_in(
        user: &str,
        password: &str,
        homeserver: &str,
        storage: Arc<dyn Storage>,
        http: Arc<dyn HttpClient>,
    ) -> ClientResult<Self> {
        let homeserver_url = parse_homeserver(homeserver)?;

        let mut body = Map::new();
        body.insert("type".into(), json!("m.login.password"));
        body.insert(
            "identifier".into(),
            json!({"type": "m.id.user", "user": user}),
        );
        body.insert("password".into(), json!(password));

        let result = Request::new(Method::Post, &["_matrix", "client", "r0", "login"])
            .with_body(body)
            .perform(http.as_ref(), &homeserver_url)
            .await;

        let response = match result {
            Ok(response) => response,
            Err(ClientError::UnexpectedStatus { status, response }) => {
                return Err(ClientError::LoginFailed {
                    user: user.to_string(),
                    status,
                    response,
                });
            }
            Err(e) => return Err(e),
        };

        let user_id = required_str(&response, "user_id")?;
        let device_id = required_str(&response, "device_id")?;
        let access_token = required_str(&response, "access_token")?;

        Self::new(user_id, device_id, access_token, homeserver, storage, http)
    }

    /// Replaces the sync options. Takes effect the next time the sync loop
    /// is started.
    #[must_use]
    pub fn with_sync_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// The user id this client acts as.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The device id this client syncs as.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The access token used to authenticate requests.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// The homeserver all requests are resolved against.
    pub fn homeserver(&self) -> &Url {
        &self.homeserver
    }

    /// The storage backing this client.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Registers the handler for errors encountered by the sync loop.
    pub fn set_sync_error_handler(&self, handler: SyncErrorHandler) {
        *self.sync_error_handler.write() = Some(handler);
    }

    /// Starts the sync loop. A no-op if the loop is already running.
    ///
    /// The loop resumes from the last persisted cursor, or performs an
    /// initial sync if none exists.
    pub fn start_sync_loop(&self) -> ClientResult<()> {
        self.ensure_active()?;

        let mut guard = self.sync_task.lock();
        if let Some(task) = guard.as_ref() {
            if task.running.load(Ordering::SeqCst) && !task.task.is_finished() {
                return Ok(());
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let ctx = SyncContext {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            access_token: self.access_token.clone(),
            homeserver: self.homeserver.clone(),
            storage: Arc::clone(&self.storage),
            http: Arc::clone(&self.http),
            options: self.options.clone(),
            handler: Arc::clone(&self.sync_error_handler),
            running: Arc::clone(&running),
        };

        let task = tokio::spawn(run_sync_loop(ctx));
        *guard = Some(SyncTask { running, task });
        Ok(())
    }

    /// Stops the sync loop.
    ///
    /// The currently waiting long-poll is not aborted; after it completes
    /// (and its result is applied), no new iteration starts. Starting the
    /// loop again resumes from the last persisted cursor.
    pub fn stop_sync_loop(&self) {
        let guard = self.sync_task.lock();
        if let Some(task) = guard.as_ref() {
            task.running.store(false, Ordering::SeqCst);
        }
    }

    /// Whether the sync loop is currently running.
    pub fn is_sync_running(&self) -> bool {
        let guard = self.sync_task.lock();
        guard
            .as_ref()
            .map(|task| task.running.load(Ordering::SeqCst) && !task.task.is_finished())
            .unwrap_or(false)
    }

    /// Logs out the device and invalidates the access token.
    ///
    /// After this succeeds the client can no longer be used; every further
    /// operation fails with [`ClientError::LoggedOut`].
    pub async fn log_out(&self) -> ClientResult<()> {
        self.ensure_active()?;

        let result = Request::new(Method::Post, &["_matrix", "client", "r0", "logout"])
            .with_access_token(self.access_token.as_str())
            .perform(self.http.as_ref(), &self.homeserver)
            .await;

        match result {
            Ok(_) => {
                self.stop_sync_loop();
                self.logged_out.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(ClientError::UnexpectedStatus { status, response }) => {
                Err(ClientError::LogoutFailed { status, response })
            }
            Err(e) => Err(e),
        }
    }

    /// Fetches the list of joined rooms from the server.
    pub async fn room_list(&self) -> ClientResult<Vec<String>> {
        self.ensure_active()?;

        let result = Request::new(Method::Get, &["_matrix", "client", "r0", "joined_rooms"])
            .with_access_token(self.access_token.as_str())
            .perform(self.http.as_ref(), &self.homeserver)
            .await;

        let response = match result {
            Ok(response) => response,
            Err(ClientError::UnexpectedStatus { status, response }) => {
                return Err(ClientError::RoomListFailed { status, response });
            }
            Err(e) => return Err(e),
        };

        let rooms = response
            .body
            .get("joined_rooms")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ClientError::MalformedResponse("response is missing joined_rooms".into())
            })?;

        rooms
            .iter()
            .map(|room| {
                room.as_str().map(str::to_string).ok_or_else(|| {
                    ClientError::MalformedResponse("joined_rooms contains a non-string".into())
                })
            })
            .collect()
    }

    /// Joins a room by id or alias and returns the resolved room id.
    ///
    /// On success the room id is added to the joined set in storage.
    pub async fn join_room(&self, room: &str) -> ClientResult<String> {
        self.ensure_active()?;

        let result = Request::new(Method::Post, &["_matrix", "client", "r0", "join", room])
            .with_access_token(self.access_token.as_str())
            .perform(self.http.as_ref(), &self.homeserver)
            .await;

        let response = match result {
            Ok(response) => response,
            Err(ClientError::UnexpectedStatus { status, response }) => {
                return Err(ClientError::JoinRoomFailed {
                    room: room.to_string(),
                    status,
                    response,
                });
            }
            Err(e) => return Err(e),
        };

        // The server may resolve an alias; storage always gets the id.
        let room_id = required_str(&response, "room_id")?.to_string();
        self.storage.add_joined_room(&room_id, &self.user_id)?;
        Ok(room_id)
    }

    /// Leaves a room and removes it from the joined set in storage.
    pub async fn leave_room(&self, room_id: &str) -> ClientResult<()> {
        self.ensure_active()?;

        let result = Request::new(
            Method::Post,
            &["_matrix", "client", "r0", "rooms", room_id, "leave"],
        )
        .with_access_token(self.access_token.as_str())
        .perform(self.http.as_ref(), &self.homeserver)
        .await;

        match result {
            Ok(_) => {
                self.storage.remove_joined_room(room_id, &self.user_id)?;
                Ok(())
            }
            Err(ClientError::UnexpectedStatus { status, response }) => {
                Err(ClientError::LeaveRoomFailed {
                    room_id: room_id.to_string(),
                    status,
                    response,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Sends a text message to a room.
    ///
    /// Each call uses a fresh client-generated transaction id, so the
    /// server can deduplicate a retried send.
    pub async fn send_message(&self, message: &str, room_id: &str) -> ClientResult<()> {
        self.ensure_active()?;

        let txn_id = uuid::Uuid::new_v4().to_string();
        let mut body = Map::new();
        body.insert("msgtype".into(), json!("m.text"));
        body.insert("body".into(), json!(message));

        let result = Request::new(
            Method::Put,
            &[
                "_matrix",
                "client",
                "r0",
                "rooms",
                room_id,
                "send",
                "m.room.message",
                &txn_id,
            ],
        )
        .with_access_token(self.access_token.as_str())
        .with_body(body)
        .perform(self.http.as_ref(), &self.homeserver)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(ClientError::UnexpectedStatus { status, response }) => {
                Err(ClientError::SendMessageFailed {
                    room_id: room_id.to_string(),
                    status,
                    response,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn ensure_active(&self) -> ClientResult<()> {
        if self.logged_out.load(Ordering::SeqCst) {
            return Err(ClientError::LoggedOut);
        }
        Ok(())
    }
}

/// Validates a homeserver address: absolute, http or https, usable as a
/// base for request paths.
fn parse_homeserver(homeserver: &str) -> ClientResult<Url> {
    let url = Url::parse(homeserver)
        .map_err(|e| ClientError::InvalidHomeserver(format!("{homeserver}: {e}")))?;

    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(ClientError::InvalidHomeserver(homeserver.to_string()));
    }

    Ok(url)
}

/// Reads a required string field from a response body.
fn required_str<'a>(response: &'a Response, key: &str) -> ClientResult<&'a str> {
    response
        .str_field(key)
        .ok_or_else(|| ClientError::MalformedResponse(format!("response is missing {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MockHttpClient;
    use tessera_storage::MemoryStorage;

    fn fixtures() -> (Arc<MemoryStorage>, Arc<MockHttpClient>) {
        (Arc::new(MemoryStorage::new()), Arc::new(MockHttpClient::new()))
    }

    fn client(storage: Arc<MemoryStorage>, http: Arc<MockHttpClient>) -> Client {
        Client::new(
            "@a:example.org",
            "D1",
            "T",
            "https://matrix.example.org",
            storage,
            http,
        )
        .unwrap()
    }

    #[test]
    fn new_validates_the_homeserver() {
        let (storage, http) = fixtures();
        let err = Client::new(
            "@a:example.org",
            "D1",
            "T",
            "not a url",
            storage.clone(),
            http.clone(),
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::InvalidHomeserver(_)));

        let err = Client::new(
            "@a:example.org",
            "D1",
            "T",
            "mailto:someone@example.org",
            storage,
            http,
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::InvalidHomeserver(_)));
    }

    #[test]
    fn new_performs_no_io() {
        let (storage, http) = fixtures();
        let _client = client(storage, http.clone());
        assert_eq!(http.request_count(), 0);
    }

    #[tokio::test]
    async fn log_in_builds_a_client_from_the_response() {
        let (storage, http) = fixtures();
        http.push_json(
            200,
            &json!({
                "user_id": "@a:example.org",
                "device_id": "D1",
                "access_token": "T"
            }),
        );

        let client = Client::log_in(
            "a",
            "secret",
            "https://matrix.example.org",
            storage,
            http.clone(),
        )
        .await
        .unwrap();

        assert_eq!(client.user_id(), "@a:example.org");
        assert_eq!(client.device_id(), "D1");
        assert_eq!(client.access_token(), "T");

        let seen = &http.requests()[0];
        assert_eq!(seen.method, Method::Post);
        assert_eq!(seen.url.path(), "/_matrix/client/r0/login");
        assert_eq!(seen.bearer_token, None);

        let body: Value = serde_json::from_slice(seen.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["type"], "m.login.password");
        assert_eq!(body["identifier"]["user"], "a");
        assert_eq!(body["password"], "secret");
    }

    #[tokio::test]
    async fn log_in_classifies_bad_credentials() {
        let (storage, http) = fixtures();
        http.push_json(403, &json!({"errcode": "M_FORBIDDEN"}));

        let err = Client::log_in(
            "a",
            "wrong",
            "https://matrix.example.org",
            storage,
            http,
        )
        .await
        .unwrap_err();

        match err {
            ClientError::LoginFailed { user, status, .. } => {
                assert_eq!(user, "a");
                assert_eq!(status, 403);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn log_in_rejects_incomplete_responses() {
        let (storage, http) = fixtures();
        http.push_json(200, &json!({"user_id": "@a:example.org"}));

        let err = Client::log_in("a", "secret", "https://matrix.example.org", storage, http)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn join_room_resolves_aliases_and_updates_storage() {
        let (storage, http) = fixtures();
        http.push_json(200, &json!({"room_id": "!abc:example.org"}));

        let client = client(storage.clone(), http.clone());
        let room_id = client.join_room("#room:example.org").await.unwrap();

        assert_eq!(room_id, "!abc:example.org");
        assert!(storage
            .joined_rooms("@a:example.org")
            .unwrap()
            .contains("!abc:example.org"));

        let seen = &http.requests()[0];
        assert_eq!(
            seen.url.path(),
            "/_matrix/client/r0/join/%23room:example.org"
        );
        assert_eq!(seen.bearer_token.as_deref(), Some("T"));
    }

    #[tokio::test]
    async fn join_room_failure_carries_context_and_leaves_storage_alone() {
        let (storage, http) = fixtures();
        http.push_json(403, &json!({"errcode": "M_FORBIDDEN"}));

        let client = client(storage.clone(), http);
        let err = client.join_room("#bad:example.org").await.unwrap_err();

        match &err {
            ClientError::JoinRoomFailed {
                room,
                status,
                response,
            } => {
                assert_eq!(room, "#bad:example.org");
                assert_eq!(*status, 403);
                assert_eq!(
                    response.get("errcode").and_then(Value::as_str),
                    Some("M_FORBIDDEN")
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.error_code(), Some("M_FORBIDDEN"));
        assert!(storage.joined_rooms("@a:example.org").unwrap().is_empty());
    }

    #[tokio::test]
    async fn leave_room_removes_from_storage() {
        let (storage, http) = fixtures();
        storage
            .add_joined_room("!abc:example.org", "@a:example.org")
            .unwrap();
        http.push_json(200, &json!({}));

        let client = client(storage.clone(), http.clone());
        client.leave_room("!abc:example.org").await.unwrap();

        assert!(storage.joined_rooms("@a:example.org").unwrap().is_empty());
        assert_eq!(
            http.requests()[0].url.path(),
            "/_matrix/client/r0/rooms/!abc:example.org/leave"
        );
    }

    #[tokio::test]
    async fn leave_room_failure_keeps_storage() {
        let (storage, http) = fixtures();
        storage
            .add_joined_room("!abc:example.org", "@a:example.org")
            .unwrap();
        http.push_json(404, &json!({"errcode": "M_NOT_FOUND"}));

        let client = client(storage.clone(), http);
        let err = client.leave_room("!abc:example.org").await.unwrap_err();

        assert!(matches!(err, ClientError::LeaveRoomFailed { status: 404, .. }));
        assert!(storage
            .joined_rooms("@a:example.org")
            .unwrap()
            .contains("!abc:example.org"));
    }

    #[tokio::test]
    async fn send_message_uses_a_fresh_transaction_id_per_call() {
        let (storage, http) = fixtures();
        http.push_json(200, &json!({"event_id": "$1"}));
        http.push_json(200, &json!({"event_id": "$2"}));

        let client = client(storage, http.clone());
        client.send_message("hi", "!abc:example.org").await.unwrap();
        client.send_message("hi", "!abc:example.org").await.unwrap();

        let seen = http.requests();
        let txn = |request: &crate::http::RawRequest| {
            request
                .url
                .path_segments()
                .unwrap()
                .next_back()
                .unwrap()
                .to_string()
        };
        assert!(seen[0]
            .url
            .path()
            .starts_with("/_matrix/client/r0/rooms/!abc:example.org/send/m.room.message/"));
        assert_ne!(txn(&seen[0]), txn(&seen[1]));
        assert_eq!(seen[0].method, Method::Put);
    }

    #[tokio::test]
    async fn send_message_failure_carries_room_and_status() {
        let (storage, http) = fixtures();
        http.push_json(429, &json!({"errcode": "M_LIMIT_EXCEEDED"}));

        let client = client(storage, http);
        let err = client
            .send_message("hi", "!abc:example.org")
            .await
            .unwrap_err();

        match err {
            ClientError::SendMessageFailed {
                room_id, status, ..
            } => {
                assert_eq!(room_id, "!abc:example.org");
                assert_eq!(status, 429);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn room_list_returns_the_joined_rooms_field() {
        let (storage, http) = fixtures();
        http.push_json(
            200,
            &json!({"joined_rooms": ["!a:example.org", "!b:example.org"]}),
        );

        let client = client(storage, http);
        let rooms = client.room_list().await.unwrap();
        assert_eq!(rooms, vec!["!a:example.org", "!b:example.org"]);
    }

    #[tokio::test]
    async fn room_list_rejects_a_missing_field() {
        let (storage, http) = fixtures();
        http.push_json(200, &json!({}));

        let client = client(storage, http);
        let err = client.room_list().await.unwrap_err();
        assert!(matches!(err, ClientError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn logged_out_client_refuses_operations_without_io() {
        let (storage, http) = fixtures();
        http.push_json(200, &json!({}));

        let client = client(storage, http.clone());
        client.log_out().await.unwrap();
        assert_eq!(http.request_count(), 1);

        let err = client.join_room("#room:example.org").await.unwrap_err();
        assert!(matches!(err, ClientError::LoggedOut));

        let err = client.log_out().await.unwrap_err();
        assert!(matches!(err, ClientError::LoggedOut));

        let err = client.start_sync_loop().unwrap_err();
        assert!(matches!(err, ClientError::LoggedOut));

        // Only the logout request ever reached the network.
        assert_eq!(http.request_count(), 1);
    }

    #[tokio::test]
    async fn failed_logout_keeps_the_client_usable() {
        let (storage, http) = fixtures();
        http.push_json(500, &json!({}));
        http.push_json(200, &json!({"joined_rooms": []}));

        let client = client(storage, http);
        let err = client.log_out().await.unwrap_err();
        assert!(matches!(err, ClientError::LogoutFailed { status: 500, .. }));

        // Still active: the next operation goes through.
        assert!(client.room_list().await.unwrap().is_empty());
    }
}
