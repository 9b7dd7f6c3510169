use super::{first_port, BindContext, Credentials, Provider, ProviderError};

const PROTOCOL: &str = "mongodb";
const ROOT_USER: &str = "root";

#[derive(Copy, Clone, Debug, Default)]
pub struct Mongodb;

impl Provider for Mongodb {
    fn bind(&self, ctx: &BindContext<'_>) -> Result<Credentials, ProviderError> {
        let service = ctx.first_service()?;
        let port = first_port(service)?.port;

        let database = ctx.param(&["mongodbDatabase"])?;
        let user = ctx
            .param(&["mongodbUsername"])?
            .unwrap_or_else(|| ROOT_USER.to_string());
        let password = if user == ROOT_USER {
            ctx.password(&["mongodb-root-password"])?
        } else {
            ctx.password(&["mongodb-password"])?
        };

        Credentials::new(
            PROTOCOL,
            ctx.host(service),
            port,
            Some(user),
            password,
            database,
        )
    }
}
