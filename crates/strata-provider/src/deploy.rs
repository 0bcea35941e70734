use crate::ProviderError;
use strata_schema::{Artifact, BuildRequest, DeployArtifact};

/// Step that runs after a successful build, e.g. installing an agent on the
/// new machine. Its failure rolls the build back like a provider failure.
pub trait Deployer: Send + Sync {
    fn deploy(
        &self,
        request: &BuildRequest,
        artifact: &Artifact,
    ) -> Result<DeployArtifact, ProviderError>;
}
