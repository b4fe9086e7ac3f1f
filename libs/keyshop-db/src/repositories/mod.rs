mod catalog_repo;
mod key_repo;
mod promo_repo;
mod settings_repo;
mod transaction_repo;
mod user_repo;

pub use catalog_repo::CatalogRepository;
pub use key_repo::KeyRepository;
pub use promo_repo::PromoRepository;
pub use settings_repo::SettingsRepository;
pub use transaction_repo::TransactionRepository;
pub use user_repo::UserRepository;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("payment id already exists: {0}")]
    DuplicateId(String),
    #[error("malformed action payload: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}
