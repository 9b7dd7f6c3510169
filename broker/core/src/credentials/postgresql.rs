use super::{first_port, BindContext, Credentials, Provider, ProviderError};

const PROTOCOL: &str = "postgresql";
const ADMIN_USER: &str = "postgres";

#[derive(Copy, Clone, Debug, Default)]
pub struct Postgresql;

impl Provider for Postgresql {
    fn bind(&self, ctx: &BindContext<'_>) -> Result<Credentials, ProviderError> {
        let service = ctx.first_service()?;
        let port = first_port(service)?.port;

        let database = ctx.param(&["postgresqlDatabase", "postgresDatabase"])?;
        let user = ctx
            .param(&["postgresqlUsername", "postgresUsername"])?
            .unwrap_or_else(|| ADMIN_USER.to_string());

        // When a separate admin password is configured, the chart stores the custom user's
        // password under its own key.
        let password = if user != ADMIN_USER && ctx.params.dig("postgresqlPostgresPassword").is_some()
        {
            ctx.password(&["postgresql-postgres-password"])?
        } else {
            // Charts before 2.0 used `postgres-password`.
            ctx.password(&["postgresql-password", "postgres-password"])?
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
