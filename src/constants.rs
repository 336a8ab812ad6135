// src/constants.rs

/// Context path used when a resolved target declares none.
pub const DEFAULT_CONTEXT: &str = ".";

/// Dockerfile path used when a resolved target declares none.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Name of the group synthesized to collect every requested name.
pub const DEFAULT_GROUP: &str = "default";

/// Prefix of a named-context value that points at another target's output.
pub const LINK_SCHEME: &str = "target:";

/// Output forced onto a target that only exists to satisfy a link.
pub const CACHE_ONLY_OUTPUT: &str = "type=cacheonly";

/// Characters allowed in target and group names.
pub const VALID_NAME_CHARS: &str = "[a-zA-Z0-9_-]+";

/// Entitlement implied by `network = "host"`.
pub const ENTITLEMENT_NETWORK_HOST: &str = "network.host";

/// Entitlement that allows insecure execution.
pub const ENTITLEMENT_SECURITY_INSECURE: &str = "security.insecure";

/// Files looked up, in order, when no file is given on the command line.
pub const DEFAULT_FILENAMES: &[&str] = &[
    "docker-bake.json",
    "docker-bake.override.json",
    "docker-bake.toml",
    "docker-bake.override.toml",
];

/// File name that makes the loader read from stdin.
pub const STDIN_FILENAME: &str = "-";
