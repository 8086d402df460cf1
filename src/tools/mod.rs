//! `tools` — the closed tool descriptor table.
//!
//! Tools are registered as descriptors (name, category, autonomy floor,
//! manifest), never as arbitrary code paths. The orchestrator dispatches only
//! against descriptors present in this registry; an unknown tool name is a
//! deny before policy evaluation even begins.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── Tool categories ──────────────────────────────────────────────────────────

/// Closed set of capability categories a tool can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    FileRead,
    FileWrite,
    FileDelete,
    ShellExec,
    NetworkRequest,
    MemoryRead,
    MemoryWrite,
    SystemInfo,
    SkillExec,
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolCategory::FileRead => "file:read",
            ToolCategory::FileWrite => "file:write",
            ToolCategory::FileDelete => "file:delete",
            ToolCategory::ShellExec => "shell:exec",
            ToolCategory::NetworkRequest => "network:request",
            ToolCategory::MemoryRead => "memory:read",
            ToolCategory::MemoryWrite => "memory:write",
            ToolCategory::SystemInfo => "system:info",
            ToolCategory::SkillExec => "skill:execute",
        };
        write!(f, "{}", s)
    }
}

impl ToolCategory {
    /// Whether this category can produce externally visible output that the
    /// egress filter must inspect.
    pub fn is_egress_bearing(&self) -> bool {
        matches!(
            self,
            ToolCategory::NetworkRequest | ToolCategory::ShellExec | ToolCategory::SkillExec
        )
    }
}

// ─── Skill manifest ───────────────────────────────────────────────────────────

/// Declared permissions for a tool, verified and signed upstream by the skill
/// system. The core consumes the manifest read-only; the signature is carried
/// opaque (verification is out of core scope).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    /// Hosts the tool may contact. Empty = no network.
    #[serde(default)]
    pub network: Vec<String>,
    /// Path patterns the tool may write under. Empty = no writes.
    #[serde(default)]
    pub filesystem: Vec<String>,
    /// Whether the tool may spawn shell commands.
    #[serde(default)]
    pub shell: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    pub permissions: Permissions,
    /// Memory ceiling for the sandboxed execution.
    pub max_memory_mb: u64,
    /// Wall-clock budget for the sandboxed execution.
    pub max_runtime_seconds: u64,
    /// Publisher signature, already verified before a request reaches us.
    #[serde(default)]
    pub signature: String,
}

impl Default for SkillManifest {
    fn default() -> Self {
        Self {
            permissions: Permissions::default(),
            max_memory_mb: 512,
            max_runtime_seconds: 30,
            signature: String::new(),
        }
    }
}

// ─── Tool descriptor ──────────────────────────────────────────────────────────

/// One registered tool: its name, capability category, the minimum autonomy
/// level at which it may run, and its manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub category: ToolCategory,
    /// Requests below this autonomy level are denied by the built-in rules.
    pub min_autonomy: u8,
    pub manifest: SkillManifest,
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Dispatch table of registered tools. Populated at startup; reads are
/// lock-free clones of immutable descriptors.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the stock tool set and conservative autonomy
    /// floors.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        for descriptor in builtin_descriptors() {
            registry.register(descriptor);
        }
        registry
    }

    /// Insert or replace a descriptor.
    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.tools.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Stock descriptor set.
///
/// Autonomy floors follow the ladder: reads run from level 1, writes from
/// level 2, shell and network from level 3.
fn builtin_descriptors() -> Vec<ToolDescriptor> {
    let read_manifest = SkillManifest::default();
    let write_manifest = SkillManifest {
        permissions: Permissions {
            filesystem: vec!["workspace/**".to_string()],
            ..Permissions::default()
        },
        ..SkillManifest::default()
    };
    let shell_manifest = SkillManifest {
        permissions: Permissions {
            filesystem: vec!["workspace/**".to_string()],
            shell: true,
            ..Permissions::default()
        },
        ..SkillManifest::default()
    };

    vec![
        ToolDescriptor {
            name: "read_file".to_string(),
            category: ToolCategory::FileRead,
            min_autonomy: 1,
            manifest: read_manifest.clone(),
        },
        ToolDescriptor {
            name: "search_files".to_string(),
            category: ToolCategory::FileRead,
            min_autonomy: 1,
            manifest: read_manifest.clone(),
        },
        ToolDescriptor {
            name: "system_info".to_string(),
            category: ToolCategory::SystemInfo,
            min_autonomy: 1,
            manifest: read_manifest.clone(),
        },
        ToolDescriptor {
            name: "memory_read".to_string(),
            category: ToolCategory::MemoryRead,
            min_autonomy: 1,
            manifest: read_manifest.clone(),
        },
        ToolDescriptor {
            name: "memory_write".to_string(),
            category: ToolCategory::MemoryWrite,
            min_autonomy: 2,
            manifest: read_manifest,
        },
        ToolDescriptor {
            name: "write_file".to_string(),
            category: ToolCategory::FileWrite,
            min_autonomy: 2,
            manifest: write_manifest.clone(),
        },
        ToolDescriptor {
            name: "delete_file".to_string(),
            category: ToolCategory::FileDelete,
            min_autonomy: 3,
            manifest: write_manifest,
        },
        ToolDescriptor {
            name: "shell_exec".to_string(),
            category: ToolCategory::ShellExec,
            min_autonomy: 3,
            manifest: shell_manifest,
        },
        ToolDescriptor {
            name: "http_request".to_string(),
            category: ToolCategory::NetworkRequest,
            min_autonomy: 3,
            manifest: SkillManifest {
                permissions: Permissions {
                    network: vec!["api.example.com".to_string()],
                    ..Permissions::default()
                },
                ..SkillManifest::default()
            },
        },
    ]
}
