//! Static capability profile table.

use codeagent_core::model::ProfileId;

use super::contract::OutputContract;
use crate::tools::{ToolRegistry, ToolSpec};

const READ_TOOLS: &[&str] = &["list_dir", "read_file", "grep"];

/// A specialised profile: a tool subset plus a behavioural contract.
#[derive(Debug, Clone)]
pub struct CapabilityProfile {
    pub id: ProfileId,
    pub description: &'static str,
    /// Allowed tools in registry order.
    pub allowed_tools: Vec<String>,
    /// Instructions handed to the collaborator.
    pub contract: &'static str,
    pub output_contract: OutputContract,
}

impl CapabilityProfile {
    pub fn allows(&self, tool: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == tool)
    }
}

struct ProfileDef {
    id: ProfileId,
    description: &'static str,
    /// `None` means every registered tool.
    tools: Option<&'static [&'static str]>,
    extra_tools: &'static [&'static str],
    contract: &'static str,
    output_contract: OutputContract,
}

const PROFILES: [ProfileDef; 6] = [
    ProfileDef {
        id: ProfileId::Root,
        description: "Generalist that plans the work and delegates to specialists.",
        tools: None,
        extra_tools: &[],
        contract: "Understand the request, inspect the workspace, and either solve it directly \
                   or delegate focused sub-tasks to specialists. Finish with a concise summary.",
        output_contract: OutputContract::Unrestricted,
    },
    ProfileDef {
        id: ProfileId::CodeReviewer,
        description: "Reviews code for bugs, style and design problems without changing it.",
        tools: Some(READ_TOOLS),
        extra_tools: &[],
        contract: "Read the relevant code and report concrete findings with file and line \
                   references. Do not modify files.",
        output_contract: OutputContract::Unrestricted,
    },
    ProfileDef {
        id: ProfileId::TestWriter,
        description: "Writes automated tests for existing code.",
        tools: Some(READ_TOOLS),
        extra_tools: &["write_file"],
        contract: "Study the code under test, then write at least one test file with write_file \
                   before answering. Summarise the tests you wrote.",
        output_contract: OutputContract::RequiresSuccessfulTool("write_file"),
    },
    ProfileDef {
        id: ProfileId::Documenter,
        description: "Writes and updates documentation.",
        tools: Some(READ_TOOLS),
        extra_tools: &["write_file", "edit_file"],
        contract: "Document the requested code accurately. Keep existing documentation style.",
        output_contract: OutputContract::Unrestricted,
    },
    ProfileDef {
        id: ProfileId::Debugger,
        description: "Reproduces and diagnoses failures by running commands.",
        tools: Some(READ_TOOLS),
        extra_tools: &["run_shell"],
        contract: "Reproduce the problem, narrow down the cause, and report the root cause with \
                   evidence.",
        output_contract: OutputContract::Unrestricted,
    },
    ProfileDef {
        id: ProfileId::Refactorer,
        description: "Restructures code without changing behaviour.",
        tools: Some(READ_TOOLS),
        extra_tools: &["write_file", "edit_file"],
        contract: "Improve structure while preserving behaviour. Describe every file you changed.",
        output_contract: OutputContract::Unrestricted,
    },
];

/// Profiles in registration order, resolved against a tool registry.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<CapabilityProfile>,
}

impl ProfileRegistry {
    /// Build the profile table. Tools missing from the registry are dropped.
    pub fn new(tools: &ToolRegistry) -> Self {
        let profiles = PROFILES
            .iter()
            .map(|def| {
                let allowed_tools = tools
                    .names()
                    .filter(|name| {
                        def.tools.is_none_or(|set| set.contains(name))
                            || def.extra_tools.contains(name)
                    })
                    .map(ToString::to_string)
                    .collect();
                CapabilityProfile {
                    id: def.id,
                    description: def.description,
                    allowed_tools,
                    contract: def.contract,
                    output_contract: def.output_contract,
                }
            })
            .collect();
        Self { profiles }
    }

    pub fn get(&self, id: ProfileId) -> &CapabilityProfile {
        &self.profiles[Self::registration_index(id)]
    }

    /// Position of a profile in registration order.
    pub fn registration_index(id: ProfileId) -> usize {
        ProfileId::ALL
            .iter()
            .position(|p| *p == id)
            .unwrap_or(ProfileId::ALL.len())
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityProfile> {
        self.profiles.iter()
    }

    /// Tool specs a profile may call, in registry order.
    pub fn tool_specs<'a>(
        &self,
        id: ProfileId,
        tools: &'a ToolRegistry,
    ) -> Vec<&'a ToolSpec> {
        let profile = self.get(id);
        tools.specs().filter(|s| profile.allows(&s.name)).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use codeagent_core::config::ToolsConfig;

    fn registry() -> ProfileRegistry {
        let mut tools = ToolRegistry::new();
        crate::tools::register_builtins(&mut tools, &ToolsConfig::default()).unwrap();
        ProfileRegistry::new(&tools)
    }

    #[test]
    fn profiles_follow_registration_order() {
        let ids: Vec<ProfileId> = registry().iter().map(|p| p.id).collect();
        assert_eq!(ids, ProfileId::ALL.to_vec());
        assert_eq!(ProfileRegistry::registration_index(ProfileId::Debugger), 4);
    }

    #[test]
    fn root_gets_every_tool() {
        assert_eq!(registry().get(ProfileId::Root).allowed_tools.len(), 6);
    }

    #[test]
    fn specialists_get_their_subsets() {
        let registry = registry();
        let reviewer = registry.get(ProfileId::CodeReviewer);
        assert_eq!(reviewer.allowed_tools, vec!["list_dir", "read_file", "grep"]);

        let tests = registry.get(ProfileId::TestWriter);
        assert!(tests.allows("write_file"));
        assert!(!tests.allows("edit_file"));
        assert!(!tests.allows("run_shell"));
        assert_eq!(
            tests.output_contract,
            OutputContract::RequiresSuccessfulTool("write_file")
        );

        assert!(registry.get(ProfileId::Debugger).allows("run_shell"));
        assert!(registry.get(ProfileId::Refactorer).allows("edit_file"));
    }
}
