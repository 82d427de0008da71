pub const DEFAULT_BASE_URL: &str = "https://developer.api.autodesk.com";
pub const DEFAULT_REGION: &str = "us-east";

/// Region-scoped service URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base_url: String,
    region: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, DEFAULT_REGION)
    }
}

impl Endpoints {
    pub fn new(base_url: impl Into<String>, region: impl Into<String>) -> Self {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        let region = region.into().trim().to_string();
        Self { base_url, region }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn token_url(&self) -> String {
        format!("{}/authentication/v2/token", self.base_url)
    }

    pub fn design_automation_url(&self) -> String {
        format!("{}/da/{}/v3", self.base_url, self.region)
    }

    pub fn workitems_url(&self) -> String {
        format!("{}/workitems", self.design_automation_url())
    }

    pub fn workitem_url(&self, id: &str) -> String {
        format!("{}/{}", self.workitems_url(), urlencoding::encode(id))
    }

    pub fn signed_object_url(&self, bucket: &str, object: &str, access: &str) -> String {
        format!(
            "{}/oss/v2/buckets/{}/objects/{}/signed?access={}",
            self.base_url,
            urlencoding::encode(bucket),
            urlencoding::encode(object),
            access
        )
    }
}
