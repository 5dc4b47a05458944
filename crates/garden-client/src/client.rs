//! Connection to a Garden server and server-wide operations.

use std::collections::BTreeMap;

use garden_common::error::{GardenError, Result, WireError};
use garden_common::types::{
    Capacity, ContainerInfoEntry, ContainerMetricsEntry, ContainerSpec, CreateResponse, Handle,
    ListResponse, Properties,
};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::container::Container;

/// Handle to a Garden server.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    /// Creates a client for `addr`, given as `host:port` or a full URL.
    #[must_use]
    pub fn new(addr: &str) -> Self {
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_owned()
        } else {
            format!("http://{addr}")
        };
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Checks that the server is up.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::Connection`] if the server is unreachable.
    pub async fn ping(&self) -> Result<()> {
        let _ = self.send(self.request(Method::GET, "/ping")).await?;
        Ok(())
    }

    /// Reports host capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn capacity(&self) -> Result<Capacity> {
        self.get_json("/capacity").await
    }

    /// Creates a container.
    ///
    /// # Errors
    ///
    /// Returns the server's error, e.g. [`GardenError::HandleAlreadyExists`].
    pub async fn create(&self, spec: ContainerSpec) -> Result<Container> {
        let created: CreateResponse = self
            .send_json(Method::POST, "/containers", &spec)
            .await?;
        tracing::debug!(handle = %created.handle, "container created");
        Ok(Container::new(self.clone(), created.handle))
    }

    /// Destroys a container.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::ContainerNotFound`] for an unknown handle.
    pub async fn destroy(&self, handle: &str) -> Result<()> {
        self.send_empty(Method::DELETE, &format!("/containers/{handle}"), None::<&()>)
            .await
    }

    /// Containers whose properties include every entry of `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn containers(&self, filter: &Properties) -> Result<Vec<Container>> {
        let request = self.request(Method::GET, "/containers").query(filter);
        let list: ListResponse = decode(self.send(request).await?).await?;
        Ok(list
            .handles
            .into_iter()
            .map(|handle| Container::new(self.clone(), handle))
            .collect())
    }

    /// Looks up a live container.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::ContainerNotFound`] for an unknown handle.
    pub async fn lookup(&self, handle: &str) -> Result<Container> {
        let container = Container::new(self.clone(), Handle::new(handle));
        let _ = container.info().await?;
        Ok(container)
    }

    /// Info of several containers, keyed by handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails; per-handle failures are
    /// reported in the entries.
    pub async fn bulk_info(&self, handles: &[Handle]) -> Result<BTreeMap<String, ContainerInfoEntry>> {
        self.send_json(Method::POST, "/bulk/info", &handles).await
    }

    /// Metrics of several containers, keyed by handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails; per-handle failures are
    /// reported in the entries.
    pub async fn bulk_metrics(
        &self,
        handles: &[Handle],
    ) -> Result<BTreeMap<String, ContainerMetricsEntry>> {
        self.send_json(Method::POST, "/bulk/metrics", &handles).await
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{path}", self.base))
    }

    /// Sends a request and turns error statuses into [`GardenError`]s.
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(connection)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.bytes().await.map_err(connection)?;
        Err(serde_json::from_slice::<WireError>(&body).map_or_else(
            |_| GardenError::Server {
                message: format!("{status}: {}", String::from_utf8_lossy(&body).trim()),
            },
            GardenError::from,
        ))
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        decode(self.send(self.request(Method::GET, path)).await?).await
    }

    pub(crate) async fn send_json<B, T>(&self, method: Method, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(method, path).json(body);
        decode(self.send(request).await?).await
    }

    pub(crate) async fn send_empty<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<()>
    where
        B: Serialize + ?Sized,
    {
        let mut request = self.request(method, path);
        if let Some(body) = body {
            request = request.json(body);
        }
        let _ = self.send(request).await?;
        Ok(())
    }
}

pub(crate) fn connection(err: reqwest::Error) -> GardenError {
    GardenError::Connection {
        message: err.to_string(),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.bytes().await.map_err(connection)?;
    Ok(serde_json::from_slice(&body)?)
}
