use super::{first_port, BindContext, Credentials, Provider, ProviderError};

const PROTOCOL: &str = "mysql";
const ROOT_USER: &str = "root";

#[derive(Copy, Clone, Debug, Default)]
pub struct Mysql;

impl Provider for Mysql {
    fn bind(&self, ctx: &BindContext<'_>) -> Result<Credentials, ProviderError> {
        let service = ctx.first_service()?;
        let port = first_port(service)?.port;

        let database = ctx.param(&["mysqlDatabase", "auth.database"])?;
        let user = ctx
            .param(&["mysqlUser", "auth.username"])?
            .unwrap_or_else(|| ROOT_USER.to_string());
        let password = if user == ROOT_USER {
            ctx.password(&["mysql-root-password"])?
        } else {
            ctx.password(&["mysql-password"])?
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
