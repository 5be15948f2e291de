//! Compiled pathways and the registry resolving them by name, tool name or
//! emulated model alias.

use std::{sync::Arc, time::Duration};

use config::PathwayConfig;
use indexmap::IndexMap;
use xxhash_rust::xxh3::Xxh3;

/// Prefix of pathways that serve tool invocations.
const TOOL_PATHWAY_PREFIX: &str = "sys_tool_";

/// A registered pathway. Immutable after registration; the fingerprint
/// covers name, templates, model and declared parameters, and keys the
/// duplicate-request coalescing.
#[derive(Debug)]
pub struct Pathway {
    pub name: String,
    pub config: PathwayConfig,
    pub fingerprint: u64,
}

impl Pathway {
    /// Compile a pathway declaration. The registry does this for configured
    /// pathways; the REST surface also compiles transient passthrough
    /// pathways for raw model names.
    pub fn compile(name: &str, config: PathwayConfig) -> Self {
        let mut hasher = Xxh3::new();

        hasher.update(name.as_bytes());

        for prompt in &config.prompts {
            hasher.update(prompt.as_bytes());
        }

        hasher.update(config.model.as_bytes());

        for key in config.inputs.keys() {
            hasher.update(key.as_bytes());
        }

        Self {
            name: name.to_string(),
            fingerprint: hasher.digest(),
            config,
        }
    }

    /// The request deadline for this pathway.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}

/// All registered pathways, in registration order.
pub struct PathwayRegistry {
    pathways: IndexMap<String, Arc<Pathway>>,
    /// Emulated model alias to pathway name; first registration wins.
    aliases: IndexMap<String, String>,
}

impl PathwayRegistry {
    /// Compile a configuration's pathway table.
    pub fn from_config(pathways: &IndexMap<String, PathwayConfig>) -> Self {
        let mut compiled = IndexMap::with_capacity(pathways.len());
        let mut aliases: IndexMap<String, String> = IndexMap::new();

        for (name, config) in pathways {
            if let Some(alias) = &config.emulate_openai_chat_model {
                if let Some(owner) = aliases.get(alias) {
                    log::warn!(
                        "pathway '{name}' claims emulated model '{alias}' already owned by '{owner}'; ignoring"
                    );
                } else {
                    aliases.insert(alias.clone(), name.clone());
                }
            }

            compiled.insert(name.clone(), Arc::new(Pathway::compile(name, config.clone())));
        }

        Self {
            pathways: compiled,
            aliases,
        }
    }

    /// Look up a pathway by name.
    pub fn get(&self, name: &str) -> Option<Arc<Pathway>> {
        self.pathways.get(name).cloned()
    }

    /// Resolve the pathway serving a tool invocation: `sys_tool_<name>`,
    /// matched case-insensitively.
    pub fn tool_pathway(&self, tool_name: &str) -> Option<Arc<Pathway>> {
        let wanted = format!("{TOOL_PATHWAY_PREFIX}{tool_name}");

        self.pathways
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&wanted))
            .map(|(_, pathway)| Arc::clone(pathway))
    }

    /// Resolve an emulated OpenAI model alias to its owning pathway.
    pub fn by_emulated_model(&self, alias: &str) -> Option<Arc<Pathway>> {
        self.aliases.get(alias).and_then(|name| self.get(name))
    }

    /// All claimed aliases in registration order.
    pub fn emulated_aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases.iter().map(|(alias, name)| (alias.as_str(), name.as_str()))
    }

    /// All pathways in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pathway>> {
        self.pathways.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pathway_config(model: &str) -> PathwayConfig {
        PathwayConfig {
            model: model.to_string(),
            ..PathwayConfig::default()
        }
    }

    #[test]
    fn fingerprints_differ_by_template_and_model() {
        let a = Pathway::compile("p", pathway_config("m1"));
        let b = Pathway::compile("p", pathway_config("m2"));

        let mut with_prompt = pathway_config("m1");
        with_prompt.prompts = vec!["different {{text}}".to_string()];
        let c = Pathway::compile("p", with_prompt);

        assert_ne!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);

        let again = Pathway::compile("p", pathway_config("m1"));
        assert_eq!(a.fingerprint, again.fingerprint);
    }

    #[test]
    fn tool_pathways_resolve_case_insensitively() {
        let mut pathways = IndexMap::new();
        pathways.insert("sys_tool_Sum".to_string(), pathway_config("m"));

        let registry = PathwayRegistry::from_config(&pathways);

        assert!(registry.tool_pathway("sum").is_some());
        assert!(registry.tool_pathway("SUM").is_some());
        assert!(registry.tool_pathway("other").is_none());
    }

    #[test]
    fn first_registered_pathway_owns_a_contested_alias() {
        let mut first = pathway_config("m");
        first.emulate_openai_chat_model = Some("cortex-chat".to_string());

        let mut second = pathway_config("m");
        second.emulate_openai_chat_model = Some("cortex-chat".to_string());

        let mut pathways = IndexMap::new();
        pathways.insert("alpha".to_string(), first);
        pathways.insert("omega".to_string(), second);

        let registry = PathwayRegistry::from_config(&pathways);

        let owner = registry.by_emulated_model("cortex-chat").unwrap();
        assert_eq!(owner.name, "alpha");
        assert_eq!(registry.emulated_aliases().count(), 1);
    }
}
