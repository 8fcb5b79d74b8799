use std::{sync::Arc, time::Duration};

use rusqlite::params;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::{
    auth::{Authorization, NewAuthorization, Permission, Table, insert_authorization},
    engine::DEFAULT_RETENTION_POLICY,
    error::StoreError,
    password::{MIN_PASSWORD_LENGTH, PasswordError, generate_token, hash_password},
    store::{MetaStore, unix_now},
    tenant::{Bucket, NewBucket, Organization, User, insert_bucket, insert_organization, insert_user},
};

#[derive(Debug, Error)]
pub enum OnboardingError {
    #[error("instance has already been set up")]
    AlreadyOnboarded,
    #[error("invalid onboarding request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct OnboardingRequest {
    pub user: String,
    pub password: String,
    pub org: String,
    pub bucket: String,
    /// `None` keeps data forever.
    pub retention: Option<Duration>,
    /// Pre-supplied API token; generated when absent.
    pub token: Option<String>,
}

impl std::fmt::Debug for OnboardingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnboardingRequest")
            .field("user", &self.user)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("retention", &self.retention)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl OnboardingRequest {
    fn validate(&self) -> Result<(), OnboardingError> {
        for (field, value) in [
            ("username", &self.user),
            ("org", &self.org),
            ("bucket", &self.bucket),
        ] {
            if value.trim().is_empty() {
                return Err(OnboardingError::InvalidRequest(format!(
                    "{field} must not be empty"
                )));
            }
        }
        if self.password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(OnboardingError::InvalidRequest(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }
        if self.token.as_deref().is_some_and(str::is_empty) {
            return Err(OnboardingError::InvalidRequest(
                "token must not be empty when given".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OnboardingResult {
    pub org: Organization,
    pub user: User,
    pub bucket: Bucket,
    pub auth: Authorization,
}

pub trait OnboardingService: Send + Sync {
    /// True while the store has never been set up.
    fn is_onboarding(&self) -> Result<bool, OnboardingError>;

    fn onboard(&self, request: &OnboardingRequest) -> Result<OnboardingResult, OnboardingError>;
}

/// Writes every onboarding record in one transaction: a failure part way
/// leaves the store as fresh as it was.
pub struct SqlOnboardingService {
    store: Arc<MetaStore>,
}

impl std::fmt::Debug for SqlOnboardingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlOnboardingService")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl SqlOnboardingService {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }
}

impl OnboardingService for SqlOnboardingService {
    fn is_onboarding(&self) -> Result<bool, OnboardingError> {
        let (onboarded, users): (bool, i64) = self.store.with_connection(|conn| {
            Ok::<_, StoreError>(conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM onboarding), (SELECT COUNT(*) FROM users)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })?;
        Ok(!onboarded && users == 0)
    }

    fn onboard(&self, request: &OnboardingRequest) -> Result<OnboardingResult, OnboardingError> {
        if !self.is_onboarding()? {
            return Err(OnboardingError::AlreadyOnboarded);
        }
        request.validate()?;

        let password_hash = hash_password(&request.password)?;
        let token = request.token.clone().unwrap_or_else(generate_token);

        let (org, user, bucket, auth) = self.store.with_connection(|conn| {
            let tx = conn.transaction().map_err(StoreError::from)?;
            let user = insert_user(&tx, &request.user, &password_hash)?;
            let org = insert_organization(&tx, &request.org)?;
            let bucket = insert_bucket(
                &tx,
                NewBucket {
                    org_id: org.id,
                    name: request.bucket.clone(),
                    description: String::new(),
                    retention: request.retention,
                    retention_policy_name: DEFAULT_RETENTION_POLICY.to_owned(),
                },
            )?;
            let auth = insert_authorization(
                &tx,
                Table::Native,
                NewAuthorization {
                    org_id: org.id,
                    user_id: user.id,
                    token,
                    description: format!("{}'s Token", user.name),
                    permissions: Permission::operator(),
                },
            )?;
            tx.execute(
                "INSERT INTO onboarding (id, onboarded_at) VALUES (0, ?1)",
                params![unix_now()?],
            )
            .map_err(|error| StoreError::from_insert(error, || "onboarding record".to_owned()))?;
            tx.commit().map_err(StoreError::from)?;
            Ok::<_, StoreError>((org, user, bucket, auth))
        })?;

        info!(
            user = %user.name,
            org = %org.name,
            bucket = %bucket.name,
            "Onboarding complete"
        );
        Ok(OnboardingResult {
            org,
            user,
            bucket,
            auth,
        })
    }
}
