//! Deployment planning
//!
//! Resources of a cluster are staged in `res_order`. A resource with
//! dependencies starts a new wave: everything staged so far is committed,
//! then the resource waits for its dependencies before it is staged.

use std::collections::{HashMap, HashSet};

use rsync_common::{AppResource, Cluster, CompositeApp, Error, Result};

/// Resources committed together, after their waits are satisfied
#[derive(Debug, Default, PartialEq)]
pub struct Wave<'a> {
    /// Resources that must be ready before this wave is staged
    pub waits: Vec<String>,
    /// Resources staged into this wave, in order
    pub resources: Vec<&'a AppResource>,
}

/// Split a cluster's resources into waves.
///
/// Dependencies must name resources that appear earlier in `res_order`; an
/// unknown, skipped or later dependency is a configuration error.
pub fn plan_waves<'a>(app: &str, cluster: &'a Cluster) -> Result<Vec<Wave<'a>>> {
    let position: HashMap<&str, usize> = cluster
        .res_order
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();
    let context = || format!("{app} on {}", cluster.name);

    for resource in cluster.dependency.keys() {
        if !position.contains_key(resource.as_str()) {
            return Err(Error::configuration(
                context(),
                format!("dependency declared for unknown resource {resource}"),
            ));
        }
    }

    let mut waves = Vec::new();
    let mut current = Wave::default();
    for (index, resource) in cluster.res_order.iter().enumerate() {
        let Some(res) = cluster.resources.get(resource) else {
            return Err(Error::configuration(
                context(),
                format!("resource {resource} in resource order has no manifest"),
            ));
        };
        if res.skip {
            continue;
        }
        let deps = cluster.dependency.get(resource).map(Vec::as_slice).unwrap_or_default();
        for dep in deps {
            match position.get(dep.as_str()) {
                Some(&at) if at < index => {}
                Some(_) => {
                    return Err(Error::configuration(
                        context(),
                        format!("{resource} depends on {dep}, which is ordered after it"),
                    ))
                }
                None => {
                    return Err(Error::configuration(
                        context(),
                        format!("{resource} depends on unknown resource {dep}"),
                    ))
                }
            }
            if cluster.resources.get(dep).is_some_and(|d| d.skip) {
                return Err(Error::configuration(
                    context(),
                    format!("{resource} depends on skipped resource {dep}"),
                ));
            }
        }
        if !deps.is_empty() {
            if !current.resources.is_empty() {
                waves.push(std::mem::take(&mut current));
            }
            for dep in deps {
                if !current.waits.contains(dep) {
                    current.waits.push(dep.clone());
                }
            }
        }
        current.resources.push(res);
    }
    if !current.resources.is_empty() {
        waves.push(current);
    }
    Ok(waves)
}

/// Every app dependency must name another app that is deployed.
///
/// A dependency on a skipped app, or on one missing from `app_order`,
/// could never be satisfied.
pub fn validate_app_dependencies(composite: &CompositeApp) -> Result<()> {
    let deployed: HashSet<&str> = composite.ordered_apps().map(|a| a.name.as_str()).collect();
    for app in composite.ordered_apps() {
        for label in app.dependency.keys() {
            if label == &app.name {
                return Err(Error::configuration(
                    &composite.name,
                    format!("app {} depends on itself", app.name),
                ));
            }
            match composite.app(label) {
                None => {
                    return Err(Error::configuration(
                        &composite.name,
                        format!("app {} depends on unknown app {label}", app.name),
                    ))
                }
                Some(dep) if dep.skip => {
                    return Err(Error::configuration(
                        &composite.name,
                        format!("app {} depends on skipped app {label}", app.name),
                    ))
                }
                Some(_) if !deployed.contains(label.as_str()) => {
                    return Err(Error::configuration(
                        &composite.name,
                        format!("app {} depends on app {label}, which is not in the app order", app.name),
                    ))
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use rsync_common::{App, Criteria};

    fn cluster(order: &[&str], deps: &[(&str, &[&str])]) -> Cluster {
        Cluster {
            name: "aws+edge".to_string(),
            res_order: order.iter().map(|s| s.to_string()).collect(),
            resources: order
                .iter()
                .map(|name| {
                    (
                        name.to_string(),
                        AppResource {
                            name: name.to_string(),
                            data: format!("kind: {name}"),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
            dependency: deps
                .iter()
                .map(|(r, d)| (r.to_string(), d.iter().map(|s| s.to_string()).collect()))
                .collect(),
            skip: false,
        }
    }

    fn names<'a>(wave: &'a Wave<'a>) -> Vec<&'a str> {
        wave.resources.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn resources_without_dependencies_form_one_wave() {
        let c = cluster(&["cm+ConfigMap", "web+Deployment"], &[]);
        let waves = plan_waves("web", &c).unwrap();
        assert_eq!(waves.len(), 1);
        assert!(waves[0].waits.is_empty());
        assert_eq!(names(&waves[0]), vec!["cm+ConfigMap", "web+Deployment"]);
    }

    /// Story: a migration job must succeed before the deployment is staged
    #[test]
    fn story_dependency_starts_a_new_wave() {
        let c = cluster(
            &["cm+ConfigMap", "migrate+Job", "web+Deployment", "web+Service"],
            &[("web+Deployment", &["migrate+Job"])],
        );
        let waves = plan_waves("web", &c).unwrap();
        assert_eq!(waves.len(), 2);
        assert_eq!(names(&waves[0]), vec!["cm+ConfigMap", "migrate+Job"]);
        assert_eq!(waves[1].waits, vec!["migrate+Job"]);
        assert_eq!(names(&waves[1]), vec!["web+Deployment", "web+Service"]);
    }

    #[test]
    fn backwards_or_unknown_dependencies_fail_closed() {
        let later = cluster(
            &["web+Deployment", "migrate+Job"],
            &[("web+Deployment", &["migrate+Job"])],
        );
        assert!(plan_waves("web", &later).unwrap_err().is_configuration());

        let unknown = cluster(&["web+Deployment"], &[("web+Deployment", &["ghost+Job"])]);
        assert!(plan_waves("web", &unknown).unwrap_err().is_configuration());

        let undeclared = cluster(&["web+Deployment"], &[("ghost+Job", &["web+Deployment"])]);
        assert!(plan_waves("web", &undeclared).unwrap_err().is_configuration());
    }

    #[test]
    fn skipped_resources_are_left_out() {
        let mut c = cluster(&["a+ConfigMap", "b+ConfigMap"], &[]);
        if let Some(r) = c.resources.get_mut("a+ConfigMap") {
            r.skip = true;
        }
        let waves = plan_waves("web", &c).unwrap();
        assert_eq!(names(&waves[0]), vec!["b+ConfigMap"]);

        c.dependency
            .insert("b+ConfigMap".to_string(), vec!["a+ConfigMap".to_string()]);
        assert!(plan_waves("web", &c).unwrap_err().is_configuration());
    }

    #[test]
    fn app_dependencies_must_name_known_apps() {
        let mut composite = CompositeApp {
            name: "shop".to_string(),
            app_order: vec!["web".to_string()],
            apps: BTreeMap::from([(
                "web".to_string(),
                App {
                    name: "web".to_string(),
                    dependency: BTreeMap::from([("db".to_string(), Criteria::ready(0))]),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        };
        assert!(validate_app_dependencies(&composite)
            .unwrap_err()
            .is_configuration());

        composite.apps.insert(
            "db".to_string(),
            App {
                name: "db".to_string(),
                ..Default::default()
            },
        );
        let err = validate_app_dependencies(&composite).unwrap_err();
        assert!(err.to_string().contains("not in the app order"));

        composite.app_order.insert(0, "db".to_string());
        validate_app_dependencies(&composite).unwrap();
    }

    #[test]
    fn dependency_on_skipped_app_fails_closed() {
        let composite = CompositeApp {
            name: "shop".to_string(),
            app_order: vec!["db".to_string(), "web".to_string()],
            apps: BTreeMap::from([
                (
                    "db".to_string(),
                    App {
                        name: "db".to_string(),
                        skip: true,
                        ..Default::default()
                    },
                ),
                (
                    "web".to_string(),
                    App {
                        name: "web".to_string(),
                        dependency: BTreeMap::from([("db".to_string(), Criteria::deployed(0))]),
                        ..Default::default()
                    },
                ),
            ]),
            ..Default::default()
        };
        let err = validate_app_dependencies(&composite).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("skipped app db"));
    }
}
