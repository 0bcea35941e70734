use serde::{Deserialize, Serialize};

/// Tag stored alongside the result data of a build.
pub const BUILD_DATA_KIND: &str = "build";

/// Result of a successful provider build.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub instance_id: String,
    pub instance_name: String,
    pub ip_address: String,
    pub domain_name: String,
    /// Login user on the machine. Empty means the provider did not choose one.
    #[serde(default)]
    pub username: String,
    /// Handle the deploy step can use to reach the machine.
    #[serde(default)]
    pub query_handle: String,
}

impl Artifact {
    /// Fill in `username` with the requester when the provider left it blank.
    pub fn default_username(&mut self, requester: &str) {
        if self.username.is_empty() {
            requester.clone_into(&mut self.username);
        }
    }
}

/// Result of the deploy step that follows a build.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeployArtifact {
    pub query_handle: String,
}

/// Result data persisted for a machine after a successful build.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildData {
    pub ip_address: String,
    pub domain_name: String,
    pub instance_id: String,
    pub instance_name: String,
    pub query_string: String,
    #[serde(default)]
    pub username: String,
}

impl BuildData {
    pub fn from_artifacts(artifact: &Artifact, deploy: &DeployArtifact) -> Self {
        Self {
            ip_address: artifact.ip_address.clone(),
            domain_name: artifact.domain_name.clone(),
            instance_id: artifact.instance_id.clone(),
            instance_name: artifact.instance_name.clone(),
            query_string: deploy.query_handle.clone(),
            username: artifact.username.clone(),
        }
    }
}

/// Keyed update applied to a machine record, tagged with the operation kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageData {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: BuildData,
}

impl StorageData {
    pub fn build(data: BuildData) -> Self {
        Self {
            kind: BUILD_DATA_KIND.to_owned(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(username: &str) -> Artifact {
        Artifact {
            instance_id: "i-1".to_owned(),
            instance_name: "alice-1".to_owned(),
            ip_address: "10.0.0.2".to_owned(),
            domain_name: "alice-1.example.net".to_owned(),
            username: username.to_owned(),
            query_handle: String::new(),
        }
    }

    #[test]
    fn username_defaults_to_requester_when_blank() {
        let mut a = artifact("");
        a.default_username("alice");
        assert_eq!(a.username, "alice");
    }

    #[test]
    fn provider_username_wins() {
        let mut a = artifact("bob");
        a.default_username("alice");
        assert_eq!(a.username, "bob");
    }

    #[test]
    fn build_data_takes_query_from_deploy() {
        let data = BuildData::from_artifacts(
            &artifact("bob"),
            &DeployArtifact {
                query_handle: "/bob/alice-1/kite".to_owned(),
            },
        );
        assert_eq!(data.query_string, "/bob/alice-1/kite");
        assert_eq!(data.instance_id, "i-1");
        assert_eq!(data.username, "bob");
    }

    #[test]
    fn storage_data_uses_wire_names() {
        let value = serde_json::to_value(StorageData::build(BuildData::default())).unwrap();
        assert_eq!(value["type"], "build");
        assert!(value["data"].get("ipAddress").is_some());
        assert!(value["data"].get("queryString").is_some());
    }
}
