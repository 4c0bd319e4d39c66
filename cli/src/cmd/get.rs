use std::process::ExitCode;

use anyhow::Context;
use anyhow::Result;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use clap::Args;
use clap::ValueEnum;
use hostform::resource::package::PackageSet;
use hostform::resource::FileClient;
use hostform::resource::FolderClient;
use hostform::resource::GroupClient;
use hostform::resource::LinkClient;
use hostform::resource::PackageClient;
use hostform::resource::ServiceClient;
use hostform::resource::UserClient;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::args::ConnectionArgs;
use crate::args::ExecutionArgs;
use crate::cmd::Run;

/// Read the current state of a resource and print it as JSON
#[derive(Debug, Args)]
pub struct GetArgs {
    #[clap(flatten)]
    connection_args: ConnectionArgs,

    #[clap(flatten)]
    execution_args: ExecutionArgs,

    /// Kind of resource.
    #[arg(value_enum)]
    kind: Kind,

    /// Path for files, folders and links, uid or gid for users and groups,
    /// unit for services, comma separated names for packages.
    id: String,

    /// Package list to read packages from [default: /etc/apk/world]
    #[arg(long)]
    world: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    File,
    Folder,
    Link,
    User,
    Group,
    Service,
    Packages,
}

impl Run for GetArgs {
    #[instrument(skip_all, fields(host = %self.connection_args.host, kind = ?self.kind, id = %self.id))]
    async fn run(&self, cancel: CancellationToken) -> Result<ExitCode> {
        let cancel = self.execution_args.deadline(&cancel);
        let session = self.execution_args.session(&self.connection_args)?;
        let id = self.id.as_str();
        let path = Utf8Path::new(id);

        let json = match self.kind {
            Kind::File => to_json(&FileClient::new(session.clone()).get(&cancel, path).await?),
            Kind::Folder => to_json(&FolderClient::new(session.clone()).get(&cancel, path).await?),
            Kind::Link => to_json(&LinkClient::new(session.clone()).get(&cancel, path).await?),
            Kind::User => {
                let uid = id.parse().context("uid must be a number")?;
                to_json(&UserClient::new(session.clone()).get(&cancel, uid).await?)
            }
            Kind::Group => {
                let gid = id.parse().context("gid must be a number")?;
                to_json(&GroupClient::new(session.clone()).get(&cancel, gid).await?)
            }
            Kind::Service => to_json(&ServiceClient::new(session.clone()).get(&cancel, id).await?),
            Kind::Packages => {
                let mut client = PackageClient::new(session.clone());
                if let Some(world) = &self.world {
                    client = client.with_world(world.clone(), "apk add");
                }
                let managed = id
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(|name| (name, None::<String>))
                    .collect::<PackageSet>();
                to_json(&client.get(&cancel, &managed).await?)
            }
        }?;
        session.close();

        println!("{json}");
        Ok(ExitCode::SUCCESS)
    }
}

fn to_json(record: &impl Serialize) -> Result<String> {
    serde_json::to_string_pretty(record).context("unable to serialize record")
}
