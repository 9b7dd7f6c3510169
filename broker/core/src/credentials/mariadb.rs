use super::{first_port, BindContext, Credentials, Provider, ProviderError};

// MariaDB speaks the MySQL wire protocol.
const PROTOCOL: &str = "mysql";
const ROOT_USER: &str = "root";

#[derive(Copy, Clone, Debug, Default)]
pub struct Mariadb;

impl Provider for Mariadb {
    fn bind(&self, ctx: &BindContext<'_>) -> Result<Credentials, ProviderError> {
        let service = ctx.first_service()?;
        let port = first_port(service)?.port;

        // Older charts configured `db.*`; newer ones use `auth.*`.
        let database = ctx.param(&["db.name", "mariadbDatabase", "auth.database"])?;
        let user = ctx
            .param(&["db.user", "mariadbUser", "auth.username"])?
            .unwrap_or_else(|| ROOT_USER.to_string());
        let password = if user == ROOT_USER {
            ctx.password(&["mariadb-root-password"])?
        } else {
            ctx.password(&["mariadb-password"])?
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
