//! Drives the build of every configured image.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{should_rebuild, BuildEngine, BuildOptions, BuilderFactory, ImageTarget};
use crate::config::ConfigFile;
use crate::error::{Error, Result};
use crate::registry::{credentials, image_prefix, registry_for_image};
use crate::ui;

/// Length of generated image tags.
const TAG_LENGTH: usize = 7;

/// Random tag of lowercase alphanumerics.
fn generate_tag() -> String {
    Uuid::new_v4().simple().to_string()[..TAG_LENGTH].to_string()
}

/// Resolve a configured path against the workdir.
fn resolve(workdir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

/// Builds images whose Dockerfile changed and records the new tags.
pub struct BuildDispatcher<'a> {
    factory: &'a dyn BuilderFactory,
    workdir: PathBuf,
    cancel: CancellationToken,
}

impl<'a> BuildDispatcher<'a> {
    #[must_use]
    pub fn new(factory: &'a dyn BuilderFactory, workdir: impl Into<PathBuf>) -> Self {
        Self {
            factory,
            workdir: workdir.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop before the next image once `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build, push and record every image that needs it.
    ///
    /// `force` is true when a build was explicitly requested. The config file
    /// is saved right after each successful build so a later failure never
    /// loses a pushed tag. Returns true if at least one image was built.
    ///
    /// # Errors
    /// Returns the first build, push, registry or persistence error, and
    /// [`Error::Cancelled`] once the cancellation token has fired.
    pub async fn build_images(&self, file: &mut ConfigFile, force: bool) -> Result<bool> {
        let mut rebuilt = false;
        let release_namespace = file.config.devspace.release.namespace.clone();
        let names: Vec<String> = file.config.images.keys().cloned().collect();

        for name in names {
            if self.cancel.is_cancelled() {
                warn!(image = %name, "Build cancelled");
                return Err(Error::Cancelled);
            }
            let Some(image) = file.config.images.get_mut(&name) else {
                continue;
            };

            let dockerfile = resolve(&self.workdir, image.build.dockerfile_path());
            let context = resolve(&self.workdir, image.build.context_path());
            if !should_rebuild(&mut image.build, &dockerfile, force)? {
                ui::print_info(&format!("Skip building image '{name}'"));
                continue;
            }

            let image = image.clone();
            let registry = registry_for_image(&file.config, &image)?;
            let (username, password) = credentials(registry);
            let engine = BuildEngine::from_config(&image.build.engine, &release_namespace);
            let target = ImageTarget {
                registry_url: image_prefix(registry).to_string(),
                image_name: image.name.clone(),
                tag: generate_tag(),
                insecure: registry.insecure.unwrap_or(false),
            };
            let options = BuildOptions {
                build_args: image
                    .build
                    .options
                    .as_ref()
                    .map(|o| o.build_args.clone())
                    .unwrap_or_default(),
            };

            ui::print_step(&format!(
                "Building image '{name}' with engine '{}'",
                engine.name()
            ));
            debug!(image = %name, target = %target.reference(), ?engine, "Starting build");

            let mut builder = self.factory.create(&engine, target.clone())?;
            let registry_label = target.auth_registry().to_string();

            let spinner = ui::Spinner::start(format!("Authenticating ({registry_label})"));
            builder
                .authenticate(&username, &password, username.is_empty())
                .await?;
            spinner.done(&format!("Authentication successful ({registry_label})"));

            builder.build_image(&context, &dockerfile, &options).await?;
            builder.push_image().await?;
            ui::print_info(&format!("Image pushed to registry ({registry_label})"));

            if let Some(image) = file.config.images.get_mut(&name) {
                image.tag = Some(target.tag.clone());
            }
            file.save()?;
            rebuilt = true;

            info!(image = %name, tag = %target.tag, "Image built");
            ui::print_success(&format!("Done building and pushing image '{name}'"));
        }

        Ok(rebuilt)
    }
}
