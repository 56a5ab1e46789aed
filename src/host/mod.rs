pub mod bridge;
pub mod dummy;
#[cfg(all(
    any(
        target_os = "linux",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "macos",
        target_os = "windows"
    ),
    feature = "jack"
))]
pub mod jack;
