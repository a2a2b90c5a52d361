use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{AgentError, Result};
use crate::fsys::FileSystem;

const OS_RELEASE_PATH: &str = "/etc/os-release";
const HOST_OS_RELEASE_PATH: &str = "/host/etc/os-release";

/// Which native network configuration system the node uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    /// Ubuntu and Debian, persisted through Netplan YAML.
    Netplan,
    /// RHEL-like distributions, persisted through NetworkManager keyfiles.
    NetworkManager,
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Netplan => f.write_str("netplan"),
            OsFamily::NetworkManager => f.write_str("networkmanager"),
        }
    }
}

pub trait OsDetector: Send + Sync {
    fn detect(&self) -> Result<OsFamily>;
}

/// Detects the OS family from os-release contents. When the agent runs in
/// a container with the host filesystem mounted under /host, the host
/// copy wins.
pub struct OsReleaseDetector {
    fs: Arc<dyn FileSystem>,
}

impl OsReleaseDetector {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    fn release_path(&self) -> PathBuf {
        let host = Path::new(HOST_OS_RELEASE_PATH);
        if self.fs.exists(host) {
            host.to_path_buf()
        } else {
            PathBuf::from(OS_RELEASE_PATH)
        }
    }
}

impl OsDetector for OsReleaseDetector {
    fn detect(&self) -> Result<OsFamily> {
        let path = self.release_path();
        let content = self
            .fs
            .read_file(&path)
            .map_err(|e| AgentError::system("unable to read os-release").with_cause(e))?;
        classify_os_release(&String::from_utf8_lossy(&content))
    }
}

fn classify_os_release(content: &str) -> Result<OsFamily> {
    let id_like = content.to_ascii_lowercase();
    if id_like.contains("ubuntu") || id_like.contains("debian") {
        return Ok(OsFamily::Netplan);
    }
    const RHEL_MARKERS: [&str; 6] = ["red hat", "rhel", "centos", "rocky", "alma", "oracle"];
    if RHEL_MARKERS.iter().any(|m| id_like.contains(m)) {
        return Ok(OsFamily::NetworkManager);
    }
    Err(AgentError::system(format!(
        "unsupported OS in os-release: {}",
        content
            .lines()
            .find(|l| l.starts_with("PRETTY_NAME="))
            .unwrap_or("unknown")
    )))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testutil::MemFs;

    #[test]
    fn test_classify_os_release() {
        struct Case<'a> {
            content: &'a str,
            family: Option<OsFamily>,
        }
        let cases = [
            Case {
                content: "NAME=\"Ubuntu\"\nID=ubuntu\nPRETTY_NAME=\"Ubuntu 22.04.3 LTS\"\n",
                family: Some(OsFamily::Netplan),
            },
            Case {
                content: "NAME=\"Debian GNU/Linux\"\nID=debian\n",
                family: Some(OsFamily::Netplan),
            },
            Case {
                content: "NAME=\"Red Hat Enterprise Linux\"\nID=\"rhel\"\n",
                family: Some(OsFamily::NetworkManager),
            },
            Case {
                content: "NAME=\"Rocky Linux\"\nID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n",
                family: Some(OsFamily::NetworkManager),
            },
            Case {
                content: "NAME=\"AlmaLinux\"\nID=\"almalinux\"\n",
                family: Some(OsFamily::NetworkManager),
            },
            Case {
                content: "NAME=\"Alpine Linux\"\nID=alpine\nPRETTY_NAME=\"Alpine Linux v3.19\"\n",
                family: None,
            },
        ];
        for case in cases {
            let result = classify_os_release(case.content);
            match case.family {
                Some(expected) => assert_eq!(result.unwrap(), expected, "{:?}", case.content),
                None => assert!(result.is_err(), "{:?}", case.content),
            }
        }
    }

    #[test]
    fn test_host_os_release_wins() {
        let fs = Arc::new(MemFs::new());
        fs.add_file(OS_RELEASE_PATH, b"ID=alpine\n");
        fs.add_file(HOST_OS_RELEASE_PATH, b"ID=ubuntu\n");
        let detector = OsReleaseDetector::new(fs);
        assert_eq!(detector.detect().unwrap(), OsFamily::Netplan);
    }

    #[test]
    fn test_missing_os_release_is_system_error() {
        let detector = OsReleaseDetector::new(Arc::new(MemFs::new()));
        let err = detector.detect().unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::System);
    }
}
