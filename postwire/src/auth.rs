//! Responses to backend authentication requests.
use md5::{Digest, Md5};

use crate::{
    Result,
    config::{Config, Password},
    error::UnsupportedAuth,
    pgpass,
    postgres::{Authentication, ProtocolError, frontend},
    scram::ScramSession,
    transport::PgStream,
};

/// Answers each `Authentication*` request during the connect phase.
///
/// The password source is consulted at the moment of the first
/// challenge; a producer's value replaces the stored password for the
/// rest of the session.
pub(crate) struct Authenticator<'a> {
    config: &'a Config,
    password: Option<String>,
    scram: Option<ScramSession>,
}

impl<'a> Authenticator<'a> {
    pub(crate) fn new(config: &'a Config) -> Self {
        Self { config, password: None, scram: None }
    }

    pub(crate) async fn respond(
        &mut self,
        auth: Authentication,
        io: &mut PgStream,
    ) -> Result<()> {
        match auth {
            Authentication::Ok => {
                // the authentication exchange is successfully completed
                self.scram = None;
            }

            Authentication::CleartextPassword => {
                // The frontend must now send a PasswordMessage containing
                // the password in clear-text form.
                let password = self.password().await?;
                io.send(frontend::PasswordMessage { password: &password })?;
                io.flush().await?;
            }

            Authentication::Md5Password { salt } => {
                // The password (with user name) encrypted via MD5, then
                // encrypted again using the 4-byte random salt.
                let password = self.password().await?;
                let digest = md5_password(&self.config.user, &password, salt);
                io.send(frontend::PasswordMessage { password: &digest })?;
                io.flush().await?;
            }

            Authentication::Sasl { mechanisms } => {
                self.password().await?;

                let cert = io.peer_cert_der().map(<[u8]>::to_vec);
                let session = ScramSession::start(
                    &mechanisms,
                    io.is_tls(),
                    cert,
                    self.config.enable_channel_binding,
                )?;

                io.send(frontend::SaslInitialResponse {
                    mechanism: session.mechanism().as_str(),
                    data: session.response(),
                })?;
                io.flush().await?;

                self.scram = Some(session);
            }

            Authentication::SaslContinue { data } => {
                let password = self.password().await?;
                let Some(scram) = self.scram.as_mut() else {
                    return Err(ProtocolError::new(
                        "SASL continuation without an initial response",
                    )
                    .into());
                };

                scram.continue_session(&password, sasl_payload(&data)?)?;
                io.send(frontend::SaslResponse { data: scram.response() })?;
                io.flush().await?;
            }

            Authentication::SaslFinal { data } => {
                let Some(scram) = self.scram.as_mut() else {
                    return Err(ProtocolError::new(
                        "SASL final message without an initial response",
                    )
                    .into());
                };

                scram.finalize(sasl_payload(&data)?)?;
                self.scram = None;
            }

            Authentication::Other(_) => return Err(UnsupportedAuth.into()),
        }

        Ok(())
    }

    async fn password(&mut self) -> Result<String> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }

        let resolved = match &self.config.password {
            Password::Static(secret) => secret.expose().clone(),
            Password::Producer(producer) => (producer)().await?,
            // best-effort: a missing or unreadable pgpass file just
            // means an empty password
            Password::None => pgpass::lookup(self.config).unwrap_or_default(),
        };

        self.password = Some(resolved.clone());
        Ok(resolved)
    }
}

fn sasl_payload(data: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(data).map_err(|_| ProtocolError::new("non utf8 SASL payload"))
}

/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
pub(crate) fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password);
    hasher.update(user);
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner);
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod test {
    use super::md5_password;

    #[test]
    fn md5_digest() {
        // alice/s3cret with salt 01 02 03 04
        assert_eq!(
            md5_password("alice", "s3cret", [1, 2, 3, 4]),
            "md5b79948bbeb35dee03ab8fe15a839030b",
        );
    }
}
