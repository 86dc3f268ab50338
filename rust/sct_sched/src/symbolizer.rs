//! Program-counter to source-line resolution.
//!
//! The production [`Addr2Line`] symbolizer finds the mapping that backs a
//! PC in `/proc/<pid>/maps` and asks the `addr2line` tool about it. The
//! child process is held in a [`ChildGuard`] so it is reaped on every
//! exit path.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use tracing::{debug, trace};

use crate::static_info::DebugInfo;
use crate::types::Address;

pub trait Symbolizer: Send + Sync {
    /// Resolve `pc` to a source location. `None` means the resolver could
    /// not run at all; an unknown location is `Some("??:0")`.
    fn resolve(&self, pc: Address) -> Option<DebugInfo>;
}

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: Address,
    pub end: Address,
    pub path: String,
}

/// Parse the text of a maps file, keeping file-backed entries only.
pub fn parse_maps(text: &str) -> BTreeMap<Address, Mapping> {
    let mut maps = BTreeMap::new();
    for line in text.lines() {
        // range, perms, offset, dev, inode, then the padded path, which may
        // itself contain spaces.
        let mut fields = line.splitn(6, ' ');
        let Some(range) = fields.next() else { continue };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            Address::from_str_radix(start, 16),
            Address::from_str_radix(end, 16),
        ) else {
            continue;
        };
        let path = fields.nth(4).map_or("", str::trim);
        let path = path.strip_suffix(" (deleted)").unwrap_or(path);
        if path.is_empty() || path.starts_with('[') {
            continue;
        }
        maps.insert(
            start,
            Mapping {
                start,
                end,
                path: path.to_string(),
            },
        );
    }
    maps
}

/// The mapping with the largest start not above `pc` that still covers it.
pub fn find_mapping(maps: &BTreeMap<Address, Mapping>, pc: Address) -> Option<&Mapping> {
    maps.range(..=pc)
        .next_back()
        .map(|(_, m)| m)
        .filter(|m| m.end >= pc)
}

/// Parse the first line of `addr2line` output (`file:line`).
pub fn parse_addr2line(line: &str) -> DebugInfo {
    let line = line.trim();
    let unknown = DebugInfo::unknown();
    let Some((file, rest)) = line.rsplit_once(':') else {
        return unknown;
    };
    if rest.is_empty() || rest.starts_with('?') || file.is_empty() {
        return unknown;
    }
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse() {
        Ok(n) => DebugInfo::new(file, n, 0),
        Err(_) => unknown,
    }
}

/// Kills and reaps the wrapped child when dropped.
pub struct ChildGuard(pub Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Resolves PCs of a live process through `addr2line`.
pub struct Addr2Line {
    pid: u32,
    tool: PathBuf,
}

impl Addr2Line {
    pub fn new(pid: u32) -> Self {
        Addr2Line {
            pid,
            tool: PathBuf::from("addr2line"),
        }
    }

    /// The current process.
    pub fn for_self() -> Self {
        Self::new(std::process::id())
    }

    pub fn with_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.tool = tool.into();
        self
    }

    fn run_tool(&self, file: &str, pc: Address) -> std::io::Result<String> {
        let child = Command::new(&self.tool)
            .arg("-e")
            .arg(file)
            .arg(format!("{pc:#x}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let mut guard = ChildGuard(child);
        let mut line = String::new();
        if let Some(stdout) = guard.0.stdout.take() {
            BufReader::new(stdout).read_line(&mut line)?;
        }
        Ok(line)
    }
}

impl Symbolizer for Addr2Line {
    fn resolve(&self, pc: Address) -> Option<DebugInfo> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let text = match std::fs::read_to_string(&maps_path) {
            Ok(t) => t,
            Err(e) => {
                debug!("reading {maps_path}: {e}");
                return None;
            }
        };
        let maps = parse_maps(&text);
        let Some(mapping) = find_mapping(&maps, pc) else {
            trace!("pc {pc:#x} not in any file mapping");
            return Some(DebugInfo::unknown());
        };
        match self.run_tool(&mapping.path, pc) {
            Ok(line) => Some(parse_addr2line(&line)),
            Err(e) => {
                debug!("{}: {e}", self.tool.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d4c6a00000-55d4c6a02000 r--p 00000000 fd:01 1835 /usr/bin/myapp
55d4c6a02000-55d4c6a06000 r-xp 00002000 fd:01 1835 /usr/bin/myapp
55d4c7000000-55d4c7021000 rw-p 00000000 00:00 0 [heap]
7f1e2a000000-7f1e2a028000 r-xp 00000000 fd:01 2201 /lib/x86_64-linux-gnu/libc.so.6
7f1e2b000000-7f1e2b001000 rw-p 00000000 00:00 0
";

    #[test]
    fn test_parse_maps_keeps_file_backed_entries() {
        let maps = parse_maps(MAPS);
        assert_eq!(maps.len(), 3);
        assert!(maps.values().all(|m| m.path.starts_with('/')));
    }

    #[test]
    fn test_parse_maps_keeps_whole_path() {
        let text = "\
7f00a0000000-7f00a0010000 r-xp 00000000 fd:01 4411                       /opt/My App/lib/libfoo.so
7f00b0000000-7f00b0010000 r-xp 00000000 fd:01 4412                       /tmp/worker (deleted)
7f00c0000000-7f00c0001000 rw-p 00000000 00:00 0 \n";
        let maps = parse_maps(text);
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[&0x7f00a0000000].path, "/opt/My App/lib/libfoo.so");
        assert_eq!(maps[&0x7f00b0000000].path, "/tmp/worker");
    }

    #[test]
    fn test_find_mapping() {
        let maps = parse_maps(MAPS);
        let m = find_mapping(&maps, 0x55d4c6a03000).unwrap();
        assert_eq!(m.start, 0x55d4c6a02000);
        assert_eq!(m.path, "/usr/bin/myapp");

        let m = find_mapping(&maps, 0x7f1e2a000010).unwrap();
        assert!(m.path.ends_with("libc.so.6"));

        // Heap and anonymous memory are not file backed.
        assert!(find_mapping(&maps, 0x55d4c7000100).is_none());
        assert!(find_mapping(&maps, 0x1000).is_none());
    }

    #[test]
    fn test_parse_addr2line() {
        assert_eq!(
            parse_addr2line("/src/app/main.c:42\n"),
            DebugInfo::new("/src/app/main.c", 42, 0)
        );
        assert_eq!(
            parse_addr2line("/src/app/main.c:17 (discriminator 3)"),
            DebugInfo::new("/src/app/main.c", 17, 0)
        );
        assert_eq!(parse_addr2line("??:0"), DebugInfo::unknown());
        assert_eq!(parse_addr2line("main.c:?"), DebugInfo::unknown());
        assert_eq!(parse_addr2line(""), DebugInfo::unknown());
        assert_eq!(parse_addr2line("garbage"), DebugInfo::unknown());
    }

    #[test]
    fn test_missing_tool_is_not_fatal() {
        let s = Addr2Line::for_self().with_tool("/nonexistent/addr2line");
        let pc = test_missing_tool_is_not_fatal as usize as Address;
        // Either the tool fails to spawn or the pc is outside file mappings.
        let r = s.resolve(pc);
        assert!(r.is_none() || r == Some(DebugInfo::unknown()));
    }
}
