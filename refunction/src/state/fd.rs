use std::{fs, io::ErrorKind, path::PathBuf};

use refunction_common::{
    anyhow::{Context, Result},
    nix::unistd::Pid,
    procfs::process::Process,
};

/// An open descriptor of the traced process. Only used for comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub fd: i32,
    pub target: PathBuf,
    /// Raw text of `/proc/<pid>/fdinfo/<fd>`.
    pub info: String,
}

pub(crate) fn read_file_descriptors(pid: Pid) -> Result<Vec<FileDescriptor>> {
    let proc = Process::new(pid.as_raw()).with_context(|| format!("could not open process {pid}"))?;

    let mut fds = proc
        .fd()
        .with_context(|| format!("could not list file descriptors of {pid}"))?
        .map(|fd| -> Result<Option<FileDescriptor>> {
            let fd = fd.context("fd")?.fd;
            let inspect = || -> std::io::Result<FileDescriptor> {
                Ok(FileDescriptor {
                    fd,
                    target: fs::read_link(format!("/proc/{pid}/fd/{fd}"))?,
                    info: fs::read_to_string(format!("/proc/{pid}/fdinfo/{fd}"))?,
                })
            };
            match inspect() {
                Ok(fd) => Ok(Some(fd)),
                // closed while listing
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e).with_context(|| format!("could not inspect fd {fd}")),
            }
        })
        .filter_map(Result::transpose)
        .collect::<Result<Vec<_>>>()?;

    fds.sort_by_key(|f| f.fd);
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;

    #[test]
    fn test_read_own_file_descriptors() {
        let file = File::open("/proc/self/status").unwrap();
        let fds = read_file_descriptors(Pid::this()).unwrap();

        let mine = fds
            .iter()
            .find(|f| f.target.ends_with("status"))
            .expect("opened file is listed");
        assert!(mine.info.contains("pos:"));
        assert!(fds.windows(2).all(|w| w[0].fd < w[1].fd));
        drop(file);
    }
}
