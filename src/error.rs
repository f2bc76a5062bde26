use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdleError {
    #[error("Armazenamento de atividade indisponível: {0}")]
    StoreUnavailable(String),

    #[error("Falha ao invalidar sessão do host: {0}")]
    HostSession(String),

    #[error("Configuração inválida: {0}")]
    Configuration(String),

    #[error("Erro ao serializar política: {0}")]
    SerializationError(String),
}

impl From<redis::RedisError> for IdleError {
    fn from(err: redis::RedisError) -> Self {
        IdleError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for IdleError {
    fn from(err: serde_json::Error) -> Self {
        IdleError::SerializationError(err.to_string())
    }
}
