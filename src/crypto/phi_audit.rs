//! Log hygiene check. Every `tracing::` call under `src/` is scanned for
//! patient fields and secret material; log lines carry record ids and
//! counts only.
