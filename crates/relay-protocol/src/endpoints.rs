//! Control-plane endpoint and parameter names.

/// `GET /download?image=<name>`: streamed export.
pub const DOWNLOAD: &str = "/download";

/// `GET /cleanup?file=<artifact-file>`: delete an exported artifact.
pub const CLEANUP: &str = "/cleanup";

/// `GET /health`: unauthenticated liveness probe.
pub const HEALTH: &str = "/health";

/// Query parameter naming the image on `/download`.
pub const IMAGE_PARAM: &str = "image";

/// Query parameter naming the artifact file on `/cleanup`.
pub const FILE_PARAM: &str = "file";

/// Scheme prefix of the `Authorization` header value.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Content type of the download event stream.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";
