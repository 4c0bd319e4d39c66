//! Parsers for `stat -c` output.

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;

use super::field;
use super::ParseError;

/// Whitespace separated format. The name goes last since it may contain
/// spaces.
pub const TERSE_FORMAT: &str = "%f %u %U %g %G %s %X %Y %Z %n";

/// JSON format. Leaves out the name, callers already know the path.
pub const JSON_FORMAT: &str = r#"{"mode":"%f","uid":%u,"owner":"%U","gid":%g,"group":"%G","size":%s,"atime":%X,"mtime":%Y,"ctime":%Z}"#;

/// Shell command printing `$var` in [`TERSE_FORMAT`] without following links.
#[must_use]
pub fn terse(var: &str) -> String {
    format!("stat -c '{TERSE_FORMAT}' -- \"${var}\"")
}

/// Shell command printing `$var` in [`JSON_FORMAT`] without following links.
#[must_use]
pub fn json(var: &str) -> String {
    format!("stat -c '{JSON_FORMAT}' -- \"${var}\"")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Decodes the `S_IFMT` bits of a raw mode.
    #[must_use]
    pub fn from_mode(raw: u32) -> Option<Self> {
        Some(match raw & 0o170_000 {
            0o100_000 => Self::Regular,
            0o040_000 => Self::Directory,
            0o120_000 => Self::Symlink,
            0o020_000 => Self::CharDevice,
            0o060_000 => Self::BlockDevice,
            0o010_000 => Self::Fifo,
            0o140_000 => Self::Socket,
            _ => return None,
        })
    }
}

/// Filesystem metadata of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub path: Utf8PathBuf,
    pub kind: FileKind,
    /// Permission bits including setuid, setgid and sticky.
    #[serde(serialize_with = "serialize_mode")]
    pub mode: u32,
    pub uid: u32,
    pub owner: String,
    pub gid: u32,
    pub group: String,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_mode<S: serde::Serializer>(mode: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{mode:04o}"))
}

fn split_mode(hex: &str) -> Result<(FileKind, u32), ParseError> {
    let raw = u32::from_str_radix(hex, 16).map_err(|_| ParseError::InvalidField {
        field: "mode",
        value: hex.to_owned(),
    })?;
    let kind = FileKind::from_mode(raw).ok_or_else(|| ParseError::InvalidField {
        field: "file type",
        value: hex.to_owned(),
    })?;
    Ok((kind, raw & 0o7777))
}

/// Parses one line of [`TERSE_FORMAT`] output.
///
/// # Errors
///
/// If the line does not have exactly ten fields or a field is malformed.
pub fn parse_terse(line: &str) -> Result<FileStat, ParseError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let fields: Vec<&str> = line.splitn(10, ' ').collect();
    let [mode, uid, owner, gid, group, size, atime, mtime, ctime, name] = fields[..] else {
        return Err(ParseError::FieldCount {
            expected: 10,
            found: fields.len(),
            line: line.to_owned(),
        });
    };
    if name.is_empty() {
        return Err(ParseError::Malformed(line.to_owned()));
    }

    let (kind, mode) = split_mode(mode)?;
    Ok(FileStat {
        path: name.into(),
        kind,
        mode,
        uid: field("uid", uid)?,
        owner: owner.to_owned(),
        gid: field("gid", gid)?,
        group: group.to_owned(),
        size: field("size", size)?,
        atime: field("atime", atime)?,
        mtime: field("mtime", mtime)?,
        ctime: field("ctime", ctime)?,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStat {
    mode: String,
    uid: u32,
    owner: String,
    gid: u32,
    group: String,
    size: u64,
    atime: i64,
    mtime: i64,
    ctime: i64,
}

/// Parses one object of [`JSON_FORMAT`] output for `path`.
///
/// # Errors
///
/// If the output is not the expected object.
pub fn parse_json(path: impl Into<Utf8PathBuf>, output: &str) -> Result<FileStat, ParseError> {
    let raw: RawStat = serde_json::from_str(output.trim())?;
    let (kind, mode) = split_mode(&raw.mode)?;
    Ok(FileStat {
        path: path.into(),
        kind,
        mode,
        uid: raw.uid,
        owner: raw.owner,
        gid: raw.gid,
        group: raw.group,
        size: raw.size,
        atime: raw.atime,
        mtime: raw.mtime,
        ctime: raw.ctime,
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn parses_terse() {
        let stat =
            parse_terse("81a4 0 root 0 root 5 1700000000 1700000001 1700000002 /root/test/my f\n")
                .unwrap();
        assert_eq!(stat.path, "/root/test/my f");
        assert_eq!(stat.kind, FileKind::Regular);
        assert_eq!(stat.mode, 0o644);
        assert_eq!(stat.owner, "root");
        assert_eq!(stat.size, 5);
        assert_eq!(stat.ctime, 1_700_000_002);
    }

    #[rstest]
    #[case("81a4 0 root 0 root 5 1 2 3")]
    #[case("zz 0 root 0 root 5 1 2 3 /x")]
    #[case("81a4 x root 0 root 5 1 2 3 /x")]
    #[case("f1a4 0 root 0 root 5 1 2 3 /x")]
    #[case("")]
    fn rejects_bad_terse(#[case] line: &str) {
        assert!(parse_terse(line).is_err());
    }

    #[rstest]
    #[case(0x41ed, FileKind::Directory, 0o755)]
    #[case(0xa1ff, FileKind::Symlink, 0o777)]
    #[case(0x83ed, FileKind::Regular, 0o1755)]
    fn splits_kind_and_permissions(#[case] raw: u32, #[case] kind: FileKind, #[case] mode: u32) {
        assert_eq!(split_mode(&format!("{raw:x}")).unwrap(), (kind, mode));
    }

    #[test]
    fn parses_json() {
        let stat = parse_json(
            "/srv",
            r#"{"mode":"41ed","uid":1000,"owner":"app","gid":1000,"group":"app","size":4096,"atime":1,"mtime":2,"ctime":3}"#,
        )
        .unwrap();
        assert_eq!(stat.kind, FileKind::Directory);
        assert_eq!(stat.mode, 0o755);
        assert_eq!(stat.group, "app");
    }

    #[test]
    fn json_rejects_missing_field() {
        assert!(matches!(
            parse_json("/srv", r#"{"mode":"41ed"}"#),
            Err(ParseError::Json(_))
        ));
    }
}
