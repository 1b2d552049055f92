use crate::config::RegistryCredentials;
use crate::image_reference::{
    DEFAULT_TAG, ImageReference, ParseError, RegistryLocation, compute_mirror_target,
    is_already_mirrored,
};
use crate::oci_registry::{Authenticator, RegistryClient};
use crate::secret_string::SecretString;
use std::fmt;
use tracing::info;

#[derive(Debug)]
pub enum MirrorError {
    MalformedReference(ParseError),
    CredentialsUnavailable,
    TagListFailed(anyhow::Error),
    ManifestLookupFailed(anyhow::Error),
    SourcePullFailed(anyhow::Error),
    MirrorPushFailed(anyhow::Error),
}

impl std::error::Error for MirrorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MirrorError::MalformedReference(e) => Some(e),
            MirrorError::CredentialsUnavailable => None,
            MirrorError::TagListFailed(e)
            | MirrorError::ManifestLookupFailed(e)
            | MirrorError::SourcePullFailed(e)
            | MirrorError::MirrorPushFailed(e) => Some(&**e),
        }
    }
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorError::MalformedReference(e) => write!(f, "{}", e),
            MirrorError::CredentialsUnavailable => {
                write!(f, "destination registry credentials are not configured")
            }
            MirrorError::TagListFailed(e) => {
                write!(f, "failed to list destination tags: {:#}", e)
            }
            MirrorError::ManifestLookupFailed(e) => {
                write!(f, "failed to look up destination manifest: {:#}", e)
            }
            MirrorError::SourcePullFailed(e) => write!(f, "failed to pull source image: {:#}", e),
            MirrorError::MirrorPushFailed(e) => {
                write!(f, "failed to push mirrored image: {:#}", e)
            }
        }
    }
}

/// Copies images into the destination repository under a name derived from
/// their image name and tag.
pub struct Mirrorer<R> {
    registry: R,
    destination_prefix: String,
    username: Option<String>,
    password: Option<SecretString>,
}

impl<R: RegistryClient> Mirrorer<R> {
    pub fn new(registry: R, destination_prefix: &str, credentials: &RegistryCredentials) -> Self {
        Self {
            registry,
            destination_prefix: destination_prefix.trim_end_matches('/').to_string(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        }
    }

    pub fn destination_prefix(&self) -> &str {
        &self.destination_prefix
    }

    pub fn is_already_mirrored(&self, image: &str) -> bool {
        is_already_mirrored(image, &self.destination_prefix)
    }

    fn destination_authenticator(&self) -> Result<Authenticator, MirrorError> {
        match (&self.username, &self.password) {
            (Some(username), Some(password))
                if !username.trim().is_empty() && !password.is_empty() =>
            {
                Ok(Authenticator::Basic {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            _ => Err(MirrorError::CredentialsUnavailable),
        }
    }

    /// Makes sure `source` exists in the destination repository and returns the
    /// destination reference. When the destination already has the image, no
    /// content is transferred, so repeated calls are cheap.
    ///
    /// Digest-pinned images are looked up and published by digest, so two
    /// digests of the same untagged name never share a destination.
    pub async fn ensure_mirrored(&self, source: &str) -> Result<String, MirrorError> {
        let reference = ImageReference::decompose(source).map_err(MirrorError::MalformedReference)?;
        let source_location = reference.location();

        let destination_auth = self.destination_authenticator()?;

        let target = compute_mirror_target(&reference, &self.destination_prefix);
        let destination_location = RegistryLocation::from_repository(&target.destination_repository)
            .map_err(MirrorError::MalformedReference)?;
        let push_reference = target
            .tag
            .as_deref()
            .or(target.digest.as_deref())
            .unwrap_or(DEFAULT_TAG);

        let present = match &target.digest {
            Some(digest) => self
                .registry
                .manifest_exists(&destination_location, digest, &destination_auth)
                .await
                .map_err(MirrorError::ManifestLookupFailed)?,
            None => self
                .registry
                .list_tags(&destination_location, &destination_auth)
                .await
                .map_err(MirrorError::TagListFailed)?
                .iter()
                .any(|t| t == push_reference),
        };
        if present {
            info!(
                "Image {} is already present as {}, skipping copy",
                source, target.destination_reference
            );
            return Ok(target.destination_reference);
        }

        info!("Mirroring image {} to {}", source, target.destination_reference);
        let image = self
            .registry
            .pull(
                &source_location,
                reference.manifest_reference(),
                &Authenticator::Anonymous,
            )
            .await
            .map_err(MirrorError::SourcePullFailed)?;
        self.registry
            .push(&destination_location, push_reference, &image, &destination_auth)
            .await
            .map_err(MirrorError::MirrorPushFailed)?;

        info!("Mirrored image {} to {}", source, target.destination_reference);
        Ok(target.destination_reference)
    }
}
