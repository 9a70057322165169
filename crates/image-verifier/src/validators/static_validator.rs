use serde::Deserialize;

use super::ValidationError;
use crate::image::Image;

/// Unconditional allow or deny, without contacting anything.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticValidator {
    pub name: String,
    #[serde(default)]
    pub approve: bool,
}

impl StaticValidator {
    pub fn validate(&self, image: &Image) -> Result<String, ValidationError> {
        if self.approve {
            Ok(image.digest().to_string())
        } else {
            Err(ValidationError::StaticDeny)
        }
    }
}
