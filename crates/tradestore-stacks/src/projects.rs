//! Build projects of the trade-store pipelines.

use tradestore_core::executor::{BuildEnvironment, BuildProject, BuildSpec, CacheMode, PhaseKind};

use crate::service::CONTAINER_NAME;

/// Standard build image with Docker and Node.js.
pub const BUILD_IMAGE: &str = "aws/codebuild/amazonlinux2-x86_64-standard:4.0";
/// Directory the synthesized templates are written to.
pub const SYNTH_OUTPUT_DIR: &str = "cdk.out";
/// Variable the application build exports with the pushed image tag.
pub const IMAGE_TAG_VARIABLE: &str = "imageTag";
/// Project synthesizing the stack templates.
pub const INFRA_BUILD_PROJECT: &str = "CdkCodeBuildProject";
/// Project building and pushing the application image.
pub const APP_BUILD_PROJECT: &str = "AppCodeBuildProject";

fn build_environment() -> BuildEnvironment {
    BuildEnvironment {
        image: BUILD_IMAGE.to_string(),
        privileged: true,
    }
}

/// Synthesizes every stack template into `cdk.out`.
pub fn infra_build_project() -> BuildProject {
    let spec = BuildSpec::new()
        .phase(PhaseKind::Install, ["npm install"])
        .phase(
            PhaseKind::Build,
            [format!(
                "tradestore synth --environments environments.kdl --out {}",
                SYNTH_OUTPUT_DIR
            )],
        )
        .artifacts(Some(SYNTH_OUTPUT_DIR), ["**/*"]);
    BuildProject::new(INFRA_BUILD_PROJECT, build_environment(), spec)
}

/// Builds and pushes the application image, then writes
/// `imagedefinitions.json` and exports the pushed tag.
pub fn app_build_project(ecr_repo_uri: &str) -> BuildProject {
    let image_definitions = format!(
        r#"printf '[{{"name":"{}","imageUri":"%s"}}]' $ecr_repo_uri:$tag > imagedefinitions.json"#,
        CONTAINER_NAME
    );
    let spec = BuildSpec::new()
        .phase(PhaseKind::PreBuild, ["env", "export tag=latest"])
        .phase(
            PhaseKind::Build,
            [
                "docker build -t $ecr_repo_uri:$tag .",
                "$(aws ecr get-login --no-include-email)",
                "docker push $ecr_repo_uri:$tag",
            ],
        )
        .phase(
            PhaseKind::PostBuild,
            [
                image_definitions,
                "cat imagedefinitions.json".to_string(),
                format!("export {}=$tag", IMAGE_TAG_VARIABLE),
            ],
        )
        .export(IMAGE_TAG_VARIABLE)
        .artifacts(None, ["imagedefinitions.json"]);

    BuildProject::new(APP_BUILD_PROJECT, build_environment(), spec)
        .with_env("ecr_repo_uri", ecr_repo_uri)
        .with_cache(CacheMode::DockerLayer)
        .with_cache(CacheMode::Custom)
}

/// Runs the application's own build script; its output feeds synthesis.
pub fn prebuild_project() -> BuildProject {
    let spec = BuildSpec::new()
        .phase(PhaseKind::Build, ["./build.sh"])
        .artifacts(Some("build"), ["**/*"]);
    BuildProject::new("Prebuild", build_environment(), spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_build_exports_tag() {
        let project = app_build_project("registry/trade-store-app");
        assert_eq!(project.env["ecr_repo_uri"], "registry/trade-store-app");
        assert_eq!(project.spec.exported_variables, vec!["imageTag"]);
        assert_eq!(project.cache, vec![CacheMode::DockerLayer, CacheMode::Custom]);

        let script = project.spec.script();
        assert!(script.starts_with("env && export tag=latest && docker build"));
        assert!(script.contains(r#"'[{"name":"trade-store-app","imageUri":"%s"}]'"#));
        assert!(script.ends_with("then echo \"::export::imageTag=$imageTag\"; fi"));
    }

    #[test]
    fn test_infra_build_collects_synth_output() {
        let project = infra_build_project();
        assert_eq!(
            project.spec.artifacts.base_directory.as_deref(),
            Some(SYNTH_OUTPUT_DIR)
        );
        assert_eq!(project.spec.phases[0].kind, PhaseKind::Install);
        assert!(project.spec.exported_variables.is_empty());
    }
}
