//! Tipos de erro para o cliente do record store.
//!
//! Define [`StoreError`] com variantes para indisponibilidade, rate limiting,
//! recursos ausentes e falhas de rede. Usa `thiserror` para derivar `Display`
//! e `Error` a partir dos atributos `#[error(...)]`.

use thiserror::Error;

/// Erros que podem ocorrer ao consultar ou escrever no record store.
///
/// - [`Unavailable`](StoreError::Unavailable): o servidor respondeu com erro HTTP
/// - [`RateLimited`](StoreError::RateLimited): o servidor retornou HTTP 429
/// - [`NotFound`](StoreError::NotFound): o recurso pedido não existe
/// - [`Network`](StoreError::Network): falha na camada de rede
/// - [`Decode`](StoreError::Decode): o corpo da resposta não pôde ser interpretado
#[derive(Debug, Error)]
pub enum StoreError {
    /// Erro retornado pelo store (ex.: 401 token inválido, 503 indisponível).
    #[error("store error (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// HTTP 429. `retry_after_ms` indica quanto esperar antes de retentar.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to decode store response: {0}")]
    Decode(String),

    #[error("invalid store URL: {0}")]
    InvalidUrl(String),
}

impl StoreError {
    /// Falhas que podem desaparecer sozinhas numa nova tentativa.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable { status, .. } => {
                matches!(*status, 408 | 425 | 429) || *status >= 500
            }
            StoreError::RateLimited { .. } => true,
            StoreError::Network(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            StoreError::NotFound(_) | StoreError::Decode(_) | StoreError::InvalidUrl(_) => false,
        }
    }

    /// Usado pelos stores em memória para simular indisponibilidade.
    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            status: 503,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_display() {
        let err = StoreError::Unavailable {
            status: 401,
            message: "Invalid token".into(),
        };
        assert_eq!(err.to_string(), "store error (status 401): Invalid token");
        assert!(!err.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(StoreError::unavailable("down").is_transient());
        assert!(StoreError::RateLimited { retry_after_ms: 10 }.is_transient());
        assert!(!StoreError::NotFound("definitions/x".into()).is_transient());
        assert!(!StoreError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StoreError>();
    }
}
