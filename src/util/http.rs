pub use client::{Client, ClientError, Method, StatusCode};
pub use uri::{InvalidUriError, Uri};

mod uri {
    use std::fmt::Display;
    use std::str::FromStr;

    use thiserror::Error;

    #[derive(Debug, Error)]
    pub struct InvalidUriError(String);

    impl InvalidUriError {
        pub fn reason(&self) -> &str {
            self.0.as_str()
        }
    }

    impl Display for InvalidUriError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl From<http::uri::InvalidUri> for InvalidUriError {
        fn from(value: http::uri::InvalidUri) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    impl From<http::uri::InvalidUriParts> for InvalidUriError {
        fn from(value: http::uri::InvalidUriParts) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Uri(http::Uri);

    impl Uri {
        pub fn scheme(&self) -> Option<&str> {
            self.0.scheme_str()
        }

        pub fn host(&self) -> Option<&str> {
            self.0.host()
        }

        pub fn is_secure(&self) -> bool {
            self.scheme() == Some("https")
        }

        /// Replace the path of `base_uri` with `path`, keeping the scheme
        /// and authority.
        ///
        /// Any path prefix in the base address is preserved, so a server
        /// mounted under `https://example.com/sensors` gets
        /// `https://example.com/sensors/api/heartbeat`.
        pub fn join(base_uri: &Uri, path: &str) -> Result<Self, InvalidUriError> {
            let prefix = base_uri.0.path().trim_end_matches('/');
            let path_and_query =
                http::uri::PathAndQuery::from_maybe_shared(format!("{prefix}{path}"))?;
            let mut parts = base_uri.0.clone().into_parts();
            parts.path_and_query = Some(path_and_query);

            Ok(http::Uri::from_parts(parts).map(Self)?)
        }
    }

    impl Display for Uri {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl FromStr for Uri {
        type Err = InvalidUriError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Ok(http::Uri::from_str(s).map(Self)?)
        }
    }

}

mod client {
    use std::time::Duration;

    use reqwest::RequestBuilder;

    use super::uri::Uri;

    pub type Method = reqwest::Method;
    pub type StatusCode = reqwest::StatusCode;

    #[derive(Debug, thiserror::Error)]
    pub enum ClientError {
        #[error("failed to build client: {0}")]
        Build(reqwest::Error),

        #[error(transparent)]
        Client(reqwest::Error),
    }

    #[derive(Debug)]
    pub struct Response(reqwest::Response);

    impl Response {
        pub fn status(&self) -> StatusCode {
            self.0.status()
        }
    }

    // Based on: https://github.com/ramsayleung/rspotify/blob/master/rspotify-http/src/reqwest.rs
    #[derive(Debug, Clone)]
    pub struct Client {
        client: reqwest::Client,
        timeout: Option<Duration>,
    }

    impl Client {
        /// Create a client that keeps no idle connections around.
        ///
        /// Exchanges are infrequent and memory is scarce, so every request
        /// opens a fresh connection. When `accept_invalid_certs` is set, TLS
        /// certificates are not validated.
        pub fn new(
            timeout: Option<Duration>,
            accept_invalid_certs: bool,
        ) -> Result<Self, ClientError> {
            let client = reqwest::Client::builder()
                .pool_max_idle_per_host(0)
                .danger_accept_invalid_certs(accept_invalid_certs)
                .build()
                .map_err(ClientError::Build)?;

            Ok(Self { client, timeout })
        }

        /// Thin wrapper around [reqwest::Request], this is your gateway to
        /// a fully customizable client if this type's methods won't do.
        pub async fn request<D>(
            &self,
            method: Method,
            uri: &Uri,
            decorator: D,
        ) -> Result<Response, ClientError>
        where
            D: FnOnce(RequestBuilder) -> RequestBuilder,
        {
            let mut request = self.client.request(method, uri.to_string());

            if let Some(timeout) = self.timeout {
                request = request.timeout(timeout);
            }

            request = decorator(request);

            Ok(Response(request.send().await.map_err(ClientError::Client)?))
        }
    }
}
