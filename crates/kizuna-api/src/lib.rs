//! Service-agnostic synchronization protocol.
//!
//! Every remote tracker is driven through the same eight [`RequestType`]s.
//! A [`ServiceAdapter`] translates a canonical [`Request`] into an
//! [`HttpRequest`] and the resulting [`HttpResponse`] back into a canonical
//! [`Response`]; a [`ServiceClient`] binds one adapter to its
//! [`AuthController`] and a [`Transport`].

pub mod adapter;
pub mod anilist;
pub mod auth;
pub mod client;
pub mod document;
pub mod error;
pub mod kitsu;
pub mod mal;
pub mod request;
pub mod transport;

pub use adapter::{build_adapter, ServiceAdapter, REDIRECT_URI};
pub use auth::{AuthController, AuthState, CredentialSink};
pub use client::ServiceClient;
pub use error::{BuildError, ErrorClass, ErrorInfo, TransportError};
pub use request::{param, Payload, Request, RequestType, Response};
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport};
