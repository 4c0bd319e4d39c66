use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context as _;
use bon::Builder;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::fs;
use super::fs::Attributes;
use super::serialize_lossy;
use super::Call;
use super::Cause;
use super::Operation;
use super::ResourceError;
use super::ResourceKind;
use crate::protocol::sentinel_table;
use crate::protocol::stat;
use crate::protocol::stat::FileStat;
use crate::protocol::Script;
use crate::protocol::Step;
use crate::session::Session;

sentinel_table! {
    /// Exit codes of file scripts.
    pub enum FileExit {
        Ok = 0 => Meaning::Success,
        Failed = 1 => Meaning::Failure,
        Exists = 16 => Meaning::Conflict(Conflict::Path),
        NotFound = 17 => Meaning::NotFound,
        DestinationExists = 18 => Meaning::Conflict(Conflict::Destination),
    }
}

/// A regular file to create.
#[derive(Debug, Clone, Builder)]
pub struct FileSpec {
    #[builder(into)]
    pub path: Utf8PathBuf,
    #[builder(into, default)]
    pub content: Vec<u8>,
    pub mode: Option<u32>,
    #[builder(into)]
    pub owner: Option<String>,
    #[builder(into)]
    pub group: Option<String>,
    /// Gzip the content in transit.
    #[builder(default)]
    pub compress: bool,
}

/// Changes to a regular file. Unset fields are left alone.
#[derive(Debug, Clone, Default, Builder)]
pub struct FileUpdate {
    /// New location of the file.
    #[builder(into)]
    pub rename: Option<Utf8PathBuf>,
    #[builder(into)]
    pub content: Option<Vec<u8>>,
    pub mode: Option<u32>,
    #[builder(into)]
    pub owner: Option<String>,
    #[builder(into)]
    pub group: Option<String>,
    #[builder(default)]
    pub compress: bool,
}

impl FileUpdate {
    fn attributes(&self) -> Attributes<'_> {
        Attributes {
            mode: self.mode,
            owner: self.owner.as_deref(),
            group: self.group.as_deref(),
            no_dereference: false,
        }
    }
}

/// A regular file as read back from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    #[serde(flatten)]
    pub stat: FileStat,
    #[serde(serialize_with = "serialize_lossy")]
    pub content: Vec<u8>,
    /// Hex SHA-256 of `content`.
    pub checksum: String,
}

#[derive(Debug, Clone)]
pub struct FileClient {
    session: Arc<Session>,
}

impl FileClient {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// # Errors
    ///
    /// [`Cause::NotFound`] unless `path` is a regular file.
    #[instrument(skip_all, fields(%path))]
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        path: &Utf8Path,
    ) -> Result<FileRecord, ResourceError> {
        let call = Call::new(ResourceKind::File, Operation::Get, path);
        let script = Script::new()
            .param("path", path)
            .check(fs::regular("path"), FileExit::NotFound)
            .readback(readback("path"));
        self.run(cancel, &call, script).await
    }

    /// Creates the file with its content, permissions and ownership in one
    /// step. The file is removed again if any part fails.
    ///
    /// # Errors
    ///
    /// [`Cause::AlreadyExists`] if anything occupies `path`.
    #[instrument(skip_all, fields(path = %spec.path))]
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        spec: FileSpec,
    ) -> Result<FileRecord, ResourceError> {
        let call = Call::new(ResourceKind::File, Operation::Create, &spec.path);
        let attributes = Attributes {
            mode: spec.mode,
            owner: spec.owner.as_deref(),
            group: spec.group.as_deref(),
            no_dereference: false,
        };
        let (write, stdin) = write_content(&call, "path", &spec.content, spec.compress, false)?;

        let script = attributes
            .bind(Script::new().param("path", &spec.path))
            .check(fs::absent("path"), FileExit::Exists)
            .step(write.undo(r#"rm -f -- "$path""#))
            .steps(attributes.steps("path", false))
            .readback(readback("path"))
            .stdin(stdin);
        self.run(cancel, &call, script).await
    }

    /// Applies `update` to the file at `path`. Attribute changes and the
    /// rename are undone if a later part fails. Content is replaced last.
    ///
    /// # Errors
    ///
    /// [`Cause::NotFound`] unless `path` is a regular file,
    /// [`Cause::AlreadyExists`] if the rename destination is taken.
    #[instrument(skip_all, fields(%path))]
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        path: &Utf8Path,
        update: FileUpdate,
    ) -> Result<FileRecord, ResourceError> {
        let call = Call::new(ResourceKind::File, Operation::Update, path);
        let attributes = update.attributes();

        let script = attributes
            .bind(Script::new().param("path", path))
            .check(fs::regular("path"), FileExit::NotFound)
            .steps(attributes.steps("path", true));
        let (mut script, target) =
            fs::rename(script, update.rename.as_deref(), FileExit::DestinationExists);

        if let Some(content) = &update.content {
            let (write, stdin) = write_content(&call, target, content, update.compress, true)?;
            script = script.step(write).stdin(stdin);
        }

        self.run(cancel, &call, script.readback(readback(target)))
            .await
    }

    /// Removes the file. A missing file counts as removed.
    ///
    /// # Errors
    ///
    /// If removal fails.
    #[instrument(skip_all, fields(%path))]
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        path: &Utf8Path,
    ) -> Result<(), ResourceError> {
        let call = Call::new(ResourceKind::File, Operation::Delete, path);
        let script = Script::new()
            .param("path", path)
            .check(fs::regular("path"), FileExit::NotFound)
            .step(Step::run(r#"rm -f -- "$path""#));
        call.run_delete::<FileExit>(&self.session, cancel, script.into_command())
            .await
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        call: &Call,
        script: Script,
    ) -> Result<FileRecord, ResourceError> {
        let result = call
            .run::<FileExit>(&self.session, cancel, script.into_command())
            .await?;
        parse(call, &result.stdout)
    }
}

/// Step writing stdin to a temporary file next to `$var`, decompressing it
/// if needed, and moving it over `$var`. With `replace` the temporary file
/// takes the current mode and ownership of `$var`, otherwise the mode a
/// plain redirection would give it. Returns the bytes to send.
fn write_content(
    call: &Call,
    var: &str,
    content: &[u8],
    compress: bool,
    replace: bool,
) -> Result<(Step, Vec<u8>), ResourceError> {
    let (decode, stdin) = if compress {
        let compressed = gzip(content)
            .map_err(|error| call.unexpected("unable to compress content", format!("{error:#}")))?;
        ("gzip -dc", compressed)
    } else {
        ("cat", content.to_vec())
    };
    let attributes = if replace {
        format!(
            r#"chmod -- "$(stat -c %a -- "${var}")" "$_tmp" && chown -- "$(stat -c %u:%g -- "${var}")" "$_tmp""#
        )
    } else {
        r#"chmod -- "$(printf '%o' $((0666 & ~0$(umask))))" "$_tmp""#.to_owned()
    };
    let run = format!(
        r#"_tmp=$(mktemp -- "${var}.XXXXXX") && {{ {decode} > "$_tmp" && {attributes} && mv -f -- "$_tmp" "${var}" || {{ rm -f -- "$_tmp"; false; }}; }}"#
    );
    Ok((Step::run(run), stdin))
}

fn gzip(content: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

/// Prints the stat line followed by the raw content.
fn readback(var: &str) -> String {
    format!(r#"{} && cat -- "${var}""#, stat::terse(var))
}

fn parse(call: &Call, output: &[u8]) -> Result<FileRecord, ResourceError> {
    let split = output.iter().position(|&b| b == b'\n').unwrap_or(output.len());
    let (line, rest) = output.split_at(split);
    let line = std::str::from_utf8(line)
        .map_err(|_| call.unexpected("unexpected remote output", "stat line is not UTF-8".into()))?;
    let stat = stat::parse_terse(line).map_err(|error| call.malformed(&error))?;
    let content = rest.get(1..).unwrap_or_default().to_vec();

    if u64::try_from(content.len()).ok() != Some(stat.size) {
        return Err(call.error(Cause::Unexpected {
            summary: "file changed while reading".into(),
            detail: Some(format!("stat reported {} bytes, read {}", stat.size, content.len())),
        }));
    }

    let checksum = hex::encode(Sha256::digest(&content));
    Ok(FileRecord {
        stat,
        content,
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use std::fs as stdfs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::protocol::Conflict;
    use crate::testing::ScriptedConnector;
    use crate::transport::LocalConnector;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        client: FileClient,
        cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let session = Session::builder()
            .connector(Arc::new(LocalConnector::default()))
            .build();
        Fixture {
            _dir: dir,
            root,
            client: FileClient::new(Arc::new(session)),
            cancel: CancellationToken::new(),
        }
    }

    fn mode_of(path: &Utf8Path) -> u32 {
        stdfs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[tokio::test]
    async fn create_get_conflict_delete() {
        let f = fixture();
        let path = f.root.join("root/test/f");
        stdfs::create_dir_all(path.parent().unwrap()).unwrap();

        let spec = FileSpec::builder()
            .path(path.clone())
            .mode(0o644)
            .content("hello")
            .build();
        let created = f.client.create(&f.cancel, spec.clone()).await.unwrap();
        assert_eq!(created.content, b"hello");

        let got = f.client.get(&f.cancel, &path).await.unwrap();
        assert_eq!(got.content, b"hello");
        assert_eq!(got.stat.mode, 0o644);
        assert_eq!(got.stat.kind, stat::FileKind::Regular);
        assert_eq!(
            got.checksum,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let again = FileSpec {
            content: b"other".to_vec(),
            ..spec
        };
        let error = f.client.create(&f.cancel, again).await.unwrap_err();
        assert!(error.is_already_exists());
        assert!(matches!(error.cause, Cause::AlreadyExists(Conflict::Path)));
        assert_eq!(stdfs::read(&path).unwrap(), b"hello");

        f.client.delete(&f.cancel, &path).await.unwrap();
        f.client.delete(&f.cancel, &path).await.unwrap();
        assert!(!path.exists());
        assert!(f.client.get(&f.cancel, &path).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn compressed_transfer() {
        let f = fixture();
        let path = f.root.join("big");
        let content = "line\n".repeat(1000);

        let spec = FileSpec::builder()
            .path(path.clone())
            .content(content.clone())
            .compress(true)
            .build();
        let record = f.client.create(&f.cancel, spec).await.unwrap();

        assert_eq!(record.content, content.as_bytes());
        assert_eq!(stdfs::read_to_string(&path).unwrap(), content);
    }

    #[tokio::test]
    async fn compressed_content_travels_as_gzip() {
        let remote = ScriptedConnector::default().reply(0, "81a4 0 root 0 root 5 1 1 1 /f\nhello");
        let client = FileClient::new(Arc::new(remote.session()));

        let spec = FileSpec::builder()
            .path("/f")
            .content("hello")
            .compress(true)
            .build();
        client.create(&CancellationToken::new(), spec).await.unwrap();

        let sent = &remote.inputs()[0];
        assert_eq!(sent[..2], [0x1f, 0x8b]);
        assert_ne!(sent.as_slice(), b"hello");
        assert!(remote.scripts()[0].contains(r#"gzip -dc > "$_tmp""#));
    }

    #[tokio::test]
    async fn plain_content_travels_as_is() {
        let remote = ScriptedConnector::default().reply(0, "81a4 0 root 0 root 5 1 1 1 /f\nhello");
        let client = FileClient::new(Arc::new(remote.session()));

        let update = FileUpdate::builder().content("hello").build();
        client
            .update(&CancellationToken::new(), Utf8Path::new("/f"), update)
            .await
            .unwrap();

        assert_eq!(remote.inputs()[0], b"hello");
        let script = &remote.scripts()[0];
        assert!(script.contains(r#"cat > "$_tmp""#));
        assert!(script.contains(r#"mv -f -- "$_tmp" "$path""#));
    }

    #[tokio::test]
    async fn content_is_replaced_not_truncated() {
        let f = fixture();
        let path = f.root.join("f");
        let keep = f.root.join("keep");
        stdfs::write(&path, "old").unwrap();
        stdfs::set_permissions(&path, stdfs::Permissions::from_mode(0o640)).unwrap();
        stdfs::hard_link(&path, &keep).unwrap();

        let update = FileUpdate::builder().content("new").build();
        let record = f.client.update(&f.cancel, &path, update).await.unwrap();

        assert_eq!(record.content, b"new");
        assert_eq!(record.stat.mode, 0o640);
        assert_eq!(stdfs::read(&keep).unwrap(), b"old");
        assert_eq!(stdfs::read_dir(&f.root).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn empty_update_changes_nothing() {
        let f = fixture();
        let path = f.root.join("f");
        stdfs::write(&path, "keep").unwrap();
        stdfs::set_permissions(&path, stdfs::Permissions::from_mode(0o640)).unwrap();
        let before = f.client.get(&f.cancel, &path).await.unwrap();

        let after = f
            .client
            .update(&f.cancel, &path, FileUpdate::default())
            .await
            .unwrap();

        assert_eq!(after.content, before.content);
        assert_eq!(after.stat.mode, 0o640);
        assert_eq!(after.stat.mtime, before.stat.mtime);
    }

    #[tokio::test]
    async fn update_applies_every_field() {
        let f = fixture();
        let path = f.root.join("f");
        let dest = f.root.join("g");
        stdfs::write(&path, "old").unwrap();

        let update = FileUpdate::builder()
            .mode(0o600)
            .rename(dest.clone())
            .content("new")
            .build();
        let record = f.client.update(&f.cancel, &path, update).await.unwrap();

        assert_eq!(record.stat.path, dest);
        assert_eq!(record.content, b"new");
        assert!(!path.exists());
        assert_eq!(mode_of(&dest), 0o600);
    }

    #[tokio::test]
    async fn failed_update_reverts_earlier_changes() {
        let f = fixture();
        let path = f.root.join("f");
        stdfs::write(&path, "old").unwrap();
        stdfs::set_permissions(&path, stdfs::Permissions::from_mode(0o644)).unwrap();

        let update = FileUpdate::builder()
            .mode(0o600)
            .owner("hostform-no-such-user")
            .build();
        let error = f.client.update(&f.cancel, &path, update).await.unwrap_err();

        assert!(matches!(error.cause, Cause::Unexpected { .. }), "{error:?}");
        assert_eq!(mode_of(&path), 0o644);
    }

    #[tokio::test]
    async fn rename_onto_existing_path_is_refused() {
        let f = fixture();
        let path = f.root.join("f");
        let dest = f.root.join("taken");
        stdfs::write(&path, "a").unwrap();
        stdfs::write(&dest, "b").unwrap();
        stdfs::set_permissions(&path, stdfs::Permissions::from_mode(0o644)).unwrap();

        let update = FileUpdate::builder().mode(0o600).rename(dest.clone()).build();
        let error = f.client.update(&f.cancel, &path, update).await.unwrap_err();

        assert!(matches!(error.cause, Cause::AlreadyExists(Conflict::Destination)));
        assert_eq!(stdfs::read(&dest).unwrap(), b"b");
        assert_eq!(mode_of(&path), 0o644);
    }

    #[tokio::test]
    async fn other_types_are_not_files() {
        let f = fixture();
        let dir = f.root.join("dir");
        stdfs::create_dir(&dir).unwrap();
        let link = f.root.join("link");
        std::os::unix::fs::symlink("dir", &link).unwrap();

        assert!(f.client.get(&f.cancel, &dir).await.unwrap_err().is_not_found());
        assert!(f.client.get(&f.cancel, &link).await.unwrap_err().is_not_found());
        let error = f
            .client
            .update(&f.cancel, &link, FileUpdate::builder().mode(0o600).build())
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }
}
