use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// Settings the policy server hands to this policy. The allow-list holds
// volume source type identifiers as they appear in a Pod manifest
// ("configMap", "emptyDir", ...); "*" stands for every type.
#[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
#[serde(default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Settings {
    pub(crate) allowed_types: HashSet<String>,
    pub(crate) ignore_init_containers_volumes: bool,
}

impl Settings {
    pub(crate) fn allows_all_types(&self) -> bool {
        self.allowed_types.contains("*")
    }

    // "*" must be the only entry of the allow-list when present.
    fn valid(&self) -> bool {
        !(self.allows_all_types() && self.allowed_types.len() != 1)
    }
}

impl kubewarden::settings::Validatable for Settings {
    fn validate(&self) -> Result<(), String> {
        if self.valid() {
            Ok(())
        } else {
            Err("Provided settings are not valid".to_string())
        }
    }
}
