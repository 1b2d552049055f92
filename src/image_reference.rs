use std::fmt;

static DOCKER_HUB_DOMAIN: &str = "docker.io";
static DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
static DOCKER_HUB_OFFICIAL_NAMESPACE: &str = "library";
pub static DEFAULT_TAG: &str = "latest";

/// A loosely parsed container image reference, e.g. `quay.io/org/app:v1`.
///
/// Parsing is best-effort: anything that is not empty decomposes into path
/// segments, an optional tag and an optional digest. The last path segment is
/// the image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub domain: Option<String>,
    pub path: Vec<String>,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

/// Where an image lives on the wire: registry host plus repository path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryLocation {
    pub registry: String,
    pub repository: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    pub destination_repository: String,
    pub tag: Option<String>,
    /// Pinned source digest. The mirrored manifest keeps it, so the destination
    /// reference stays pinned too.
    pub digest: Option<String>,
    pub destination_reference: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    MalformedReference(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MalformedReference(image) => {
                write!(f, "malformed image reference: '{}'", image)
            }
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(domain) = &self.domain {
            write!(f, "{}/", domain)?;
        }
        write!(f, "{}", self.path.join("/"))?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    pub fn decompose(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::MalformedReference(s.to_string()));
        }

        let (without_digest, digest) = match s.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (s, None),
        };

        let mut segments: Vec<&str> = without_digest.split('/').collect();

        // Only the last segment may carry the tag, a colon before it belongs to a registry port
        let last = segments.pop().unwrap_or_default();
        let (name, tag) = match last.rfind(':') {
            Some(pos) => (&last[..pos], Some(last[pos + 1..].to_string())),
            None => (last, None),
        };
        if name.is_empty() {
            return Err(ParseError::MalformedReference(s.to_string()));
        }
        let tag = tag.filter(|t| !t.is_empty());

        let domain = match segments.first() {
            Some(first) if is_domain(first) => Some(segments.remove(0).to_string()),
            _ => None,
        };

        let mut path: Vec<String> = segments
            .into_iter()
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();
        path.push(name.to_string());

        Ok(Self {
            domain,
            path,
            tag,
            digest,
        })
    }

    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// The tag the registry resolves this reference to when pulled by tag.
    pub fn effective_tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Resolves the registry host and repository path, normalizing Docker Hub
    /// references the way the container runtime does.
    pub fn location(&self) -> RegistryLocation {
        let domain = self.domain.as_deref().unwrap_or(DOCKER_HUB_DOMAIN);
        if domain == DOCKER_HUB_DOMAIN || domain == "index.docker.io" {
            let repository = if self.path.len() == 1 {
                format!("{}/{}", DOCKER_HUB_OFFICIAL_NAMESPACE, self.path[0])
            } else {
                self.path.join("/")
            };
            return RegistryLocation {
                registry: DOCKER_HUB_REGISTRY.to_string(),
                repository,
            };
        }

        RegistryLocation {
            registry: domain.to_string(),
            repository: self.path.join("/"),
        }
    }

    /// Manifest reference used to pull this image: the digest wins over the tag.
    pub fn manifest_reference(&self) -> &str {
        self.digest.as_deref().unwrap_or_else(|| self.effective_tag())
    }
}

fn is_domain(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

impl RegistryLocation {
    /// Splits a destination repository like `registry.example.com/backup/app`
    /// into its registry host and repository path.
    pub fn from_repository(repository: &str) -> Result<Self, ParseError> {
        let reference = ImageReference::decompose(repository)?;
        Ok(reference.location())
    }
}

impl fmt::Display for RegistryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

/// Destination for a source image. Only the image name, tag and digest
/// survive, so the same name and tag from two upstream registries map to the
/// same target.
pub fn compute_mirror_target(reference: &ImageReference, destination_prefix: &str) -> MirrorTarget {
    let destination_repository = format!(
        "{}/{}",
        destination_prefix.trim_end_matches('/'),
        reference.name()
    );
    let mut destination_reference = destination_repository.clone();
    if let Some(tag) = &reference.tag {
        destination_reference.push(':');
        destination_reference.push_str(tag);
    }
    if let Some(digest) = &reference.digest {
        destination_reference.push('@');
        destination_reference.push_str(digest);
    }

    MirrorTarget {
        destination_repository,
        tag: reference.tag.clone(),
        digest: reference.digest.clone(),
        destination_reference,
    }
}

pub fn is_already_mirrored(image: &str, destination_prefix: &str) -> bool {
    let prefix = destination_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    image
        .trim()
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}
