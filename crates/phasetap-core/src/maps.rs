//! Memory-map listing parser.
//!
//! Reads `/proc/self/maps`-format text one line at a time. Only the address
//! range, the permission column and the final path component are ever
//! consulted; lines that fail to parse are skipped, never fatal.

use std::io::BufRead;

/// Permission bits of one mapped region, parsed from the 4-character
/// permission column (`rwxp`/`rwxs` order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub shared: bool,
}

impl Permissions {
    /// The mask required of a target image's code region: readable,
    /// executable, not writable, privately mapped.
    pub const READ_EXEC_PRIVATE: Permissions = Permissions {
        read: true,
        write: false,
        execute: true,
        shared: false,
    };

    pub fn parse(s: &str) -> Option<Permissions> {
        let b = s.as_bytes();
        if b.len() != 4 {
            return None;
        }
        let flag = |ch: u8, on: u8| match ch {
            c if c == on => Some(true),
            b'-' => Some(false),
            _ => None,
        };
        Some(Permissions {
            read: flag(b[0], b'r')?,
            write: flag(b[1], b'w')?,
            execute: flag(b[2], b'x')?,
            shared: match b[3] {
                b's' => true,
                b'p' => false,
                _ => return None,
            },
        })
    }
}

/// One line of the listing. Produced transiently and consumed immediately.
#[derive(Debug, Clone)]
pub struct MappedRegion {
    pub start: u64,
    pub end: u64,
    pub perms: Permissions,
    pub offset: u64,
    pub path: Option<String>,
}

impl MappedRegion {
    /// Final path component (text after the last `/`), if the region is
    /// file-backed.
    pub fn file_name(&self) -> Option<&str> {
        let path = self.path.as_deref()?;
        if !path.starts_with('/') {
            return None;
        }
        path.rsplit('/').next()
    }
}

/// Parse one listing line: `start-end perms offset dev inode [path]`.
///
/// Returns `None` for anything malformed; the caller skips such lines.
pub fn parse_line(line: &str) -> Option<MappedRegion> {
    let mut fields = line.split_whitespace();

    let range = fields.next()?;
    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    if end < start {
        return None;
    }

    let perms = Permissions::parse(fields.next()?)?;
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;

    // The path column may contain spaces; rejoin whatever is left.
    let rest: Vec<&str> = fields.collect();
    let path = if rest.is_empty() {
        None
    } else {
        Some(rest.join(" "))
    };

    Some(MappedRegion {
        start,
        end,
        perms,
        offset,
        path,
    })
}

/// Streaming reader over a maps-format listing.
pub struct RegionMapReader<R: BufRead> {
    source: R,
    line: String,
}

impl<R: BufRead> RegionMapReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            line: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for RegionMapReader<R> {
    type Item = MappedRegion;

    fn next(&mut self) -> Option<MappedRegion> {
        loop {
            self.line.clear();
            match self.source.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                // A read error ends the listing; matches treating the
                // remainder as absent rather than aborting the scan.
                Err(_) => return None,
            }
            if let Some(region) = parse_line(&self.line) {
                return Some(region);
            }
            tracing::debug!(line = %self.line.trim_end(), "skipping malformed maps line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_permissions() {
        let p = Permissions::parse("r-xp").unwrap();
        assert!(p.read && p.execute && !p.write && !p.shared);
        assert_eq!(p, Permissions::READ_EXEC_PRIVATE);

        let p = Permissions::parse("rw-s").unwrap();
        assert!(p.read && p.write && !p.execute && p.shared);

        assert!(Permissions::parse("rwx").is_none());
        assert!(Permissions::parse("q-xp").is_none());
    }

    #[test]
    fn test_parse_line_with_path() {
        let region =
            parse_line("55d1c0000000-55d1c0400000 r-xp 00001000 08:01 12345 /opt/game/game.bin")
                .unwrap();
        assert_eq!(region.start, 0x55d1c0000000);
        assert_eq!(region.end, 0x55d1c0400000);
        assert_eq!(region.offset, 0x1000);
        assert_eq!(region.perms, Permissions::READ_EXEC_PRIVATE);
        assert_eq!(region.file_name(), Some("game.bin"));
    }

    #[test]
    fn test_parse_line_anonymous() {
        let region = parse_line("7f0000000000-7f0000001000 rw-p 00000000 00:00 0").unwrap();
        assert!(region.path.is_none());
        assert!(region.file_name().is_none());
    }

    #[test]
    fn test_parse_line_path_with_spaces() {
        let region = parse_line(
            "400000-500000 r-xp 00000000 08:01 9 /home/u/My Games/Game.bin.x86_64",
        )
        .unwrap();
        assert_eq!(region.file_name(), Some("Game.bin.x86_64"));
    }

    #[test]
    fn test_parse_line_malformed() {
        assert!(parse_line("").is_none());
        assert!(parse_line("garbage").is_none());
        assert!(parse_line("40000-zzz r-xp 0 08:01 9 /bin/x").is_none());
        assert!(parse_line("500000-400000 r-xp 0 08:01 9 /bin/x").is_none());
    }

    #[test]
    fn test_reader_skips_bad_lines() {
        let listing = "garbage line\n\
                       400000-401000 r-xp 00000000 08:01 7 /usr/bin/thing\n\
                       not a region\n\
                       600000-601000 rw-p 00000000 00:00 0\n";
        let regions: Vec<_> = RegionMapReader::new(listing.as_bytes()).collect();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].file_name(), Some("thing"));
    }

    #[test]
    fn test_special_pseudo_paths_have_no_file_name() {
        let region = parse_line("7fff0000-7fff1000 r-xp 00000000 00:00 0 [vdso]").unwrap();
        assert!(region.file_name().is_none());
    }
}
