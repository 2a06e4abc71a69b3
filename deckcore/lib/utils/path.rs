//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the user's home where deck data is stored by default.
pub const DECK_HOME_DIR: &str = ".deck";

/// The environment variable overriding the deck home directory.
pub const DECK_HOME_ENV_VAR: &str = "DECK_HOME";

/// The configuration file read from the deck home directory.
pub const DECK_CONFIG_FILENAME: &str = "deck.yaml";

/// The sub directory holding the extracted guest root filesystem.
pub const ROOTFS_SUBDIR: &str = "rootfs";

/// The sub directory holding the extracted binary translator.
pub const BOX64_SUBDIR: &str = "box64";

/// The sub directory holding the extracted sandbox tool.
pub const PROOT_SUBDIR: &str = "proot";

/// The sub directory holding one directory per container.
pub const CONTAINERS_SUBDIR: &str = "containers";

/// The sub directory used for scratch files that may be discarded at any time.
pub const CACHE_SUBDIR: &str = "cache";

/// The directory inside the rootfs holding installation markers.
pub const MARKER_DIR: &str = ".deck";

/// The file recording the installed rootfs image version.
pub const IMAGE_VERSION_FILENAME: &str = ".img_version";

/// The file recording the installed translator version.
pub const BOX64_VERSION_FILENAME: &str = ".box64_version";

/// The sub directory of a container that emulates the guest's `C:` drive.
pub const DRIVE_C_SUBDIR: &str = "drive_c";

/// The sub directory of a container bound onto the guest's `/tmp`.
pub const CONTAINER_TMP_SUBDIR: &str = "tmp";

/// The sub directory of a container holding guest process logs.
pub const CONTAINER_LOG_SUBDIR: &str = "logs";

/// The file in a container root storing its metadata.
pub const CONTAINER_METADATA_FILENAME: &str = "container.json";

/// The registry hives the compatibility layer writes once a container is bootstrapped.
pub const REGISTRY_HIVES: [&str; 3] = ["system.reg", "user.reg", "userdef.reg"];

/// The guest path the compatibility-layer binaries were built to find the rootfs at.
///
/// The path is baked into those binaries, so the real rootfs is bind-mounted here.
pub const GUEST_ROOTFS_PATH: &str = "/data/data/com.winlator/files/rootfs";

/// Where the compatibility layer lives inside the rootfs.
pub const GUEST_WINE_SUBDIR: &str = "opt/wine";

/// The unprivileged guest user name.
pub const GUEST_USER: &str = "xuser";

/// Environment variable that overrides the sandbox executable.
pub const PROOT_EXE_ENV_VAR: &str = "DECK_PROOT_EXE";
