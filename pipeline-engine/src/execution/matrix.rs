// Matrix Expansion
// Expands a job template's matrix axes into concrete job instances

use crate::model::{InstanceId, JobInstance, JobTemplate, MatrixAxis, MatrixPoint, Value};

use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Result of expanding one template
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// Instances in deterministic order
    pub instances: Vec<JobInstance>,
    /// Non-fatal problems found while expanding
    pub warnings: Vec<String>,
}

/// Matrix expander for job templates
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a template into one instance per matrix point.
    ///
    /// Points are the Cartesian product of the axes in declaration order,
    /// with the first axis varying slowest. A template without axes yields
    /// exactly one instance. An axis with no values yields no instances and a
    /// warning. Points matching an `exclude` entry are dropped. A repeated
    /// axis name, or a point whose values render to an id already produced
    /// (`3.1` and `3.10`), is dropped with a warning.
    pub fn expand(template: &JobTemplate) -> Expansion {
        let mut expansion = Expansion::default();

        if !template.has_matrix() {
            expansion
                .instances
                .push(JobInstance::new(&template.name, MatrixPoint::default()));
            return expansion;
        }

        let axes = Self::distinct_axes(template, &mut expansion.warnings);

        for axis in axes.iter().filter(|a| a.values.is_empty()) {
            let message = format!(
                "matrix axis '{}' of job '{}' has no values; job expands to zero instances",
                axis.name, template.name
            );
            warn!(job = %template.name, axis = %axis.name, "matrix axis has no values");
            expansion.warnings.push(message);
        }
        if axes.iter().any(|a| a.values.is_empty()) {
            return expansion;
        }

        let mut excluded = 0;
        let mut seen: HashSet<InstanceId> = HashSet::new();
        for point in Self::points(&axes) {
            if template
                .exclude
                .iter()
                .any(|entry| Self::is_excluded(&point, entry))
            {
                excluded += 1;
                continue;
            }
            let instance = JobInstance::new(&template.name, point);
            if !seen.insert(instance.id.clone()) {
                let message = format!(
                    "duplicate matrix point '{}' of job '{}' dropped",
                    instance.id, template.name
                );
                warn!(job = %template.name, instance = %instance.id, "duplicate matrix point");
                expansion.warnings.push(message);
                continue;
            }
            expansion.instances.push(instance);
        }

        if expansion.instances.is_empty() {
            let message = format!(
                "all {} matrix points of job '{}' are excluded",
                excluded, template.name
            );
            warn!(job = %template.name, excluded, "matrix exclusions removed every point");
            expansion.warnings.push(message);
        }

        expansion
    }

    /// Axes with a name already declared earlier are dropped
    fn distinct_axes(template: &JobTemplate, warnings: &mut Vec<String>) -> Vec<MatrixAxis> {
        let mut names = HashSet::new();
        let mut axes = Vec::with_capacity(template.matrix.len());
        for axis in &template.matrix {
            if names.insert(axis.name.as_str()) {
                axes.push(axis.clone());
            } else {
                warn!(job = %template.name, axis = %axis.name, "duplicate matrix axis");
                warnings.push(format!(
                    "matrix axis '{}' of job '{}' declared twice; later declaration ignored",
                    axis.name, template.name
                ));
            }
        }
        axes
    }

    /// Cartesian product of the axes; odometer with the last axis fastest
    fn points(axes: &[MatrixAxis]) -> Vec<MatrixPoint> {
        let total: usize = axes.iter().map(|a| a.values.len()).product();
        let mut points = Vec::with_capacity(total);
        let mut cursor = vec![0usize; axes.len()];

        for _ in 0..total {
            points.push(MatrixPoint::new(
                axes.iter()
                    .zip(&cursor)
                    .map(|(axis, &i)| (axis.name.clone(), axis.values[i].clone()))
                    .collect(),
            ));

            for pos in (0..axes.len()).rev() {
                cursor[pos] += 1;
                if cursor[pos] < axes[pos].values.len() {
                    break;
                }
                cursor[pos] = 0;
            }
        }

        points
    }

    /// An exclusion matches when every axis it names has the given value
    fn is_excluded(point: &MatrixPoint, entry: &BTreeMap<String, Value>) -> bool {
        !entry.is_empty()
            && entry
                .iter()
                .all(|(axis, value)| point.get(axis).is_some_and(|v| v.matches(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(expansion: &Expansion) -> Vec<String> {
        expansion
            .instances
            .iter()
            .map(|i| i.id.to_string())
            .collect()
    }

    #[test]
    fn test_no_matrix_single_instance() {
        let expansion = MatrixExpander::expand(&JobTemplate::new("lint"));
        assert_eq!(ids(&expansion), vec!["lint"]);
        assert!(expansion.warnings.is_empty());
    }

    #[test]
    fn test_single_axis() {
        let template = JobTemplate::new("test").axis("python", ["3.6", "3.7", "3.8"]);
        let expansion = MatrixExpander::expand(&template);
        assert_eq!(
            ids(&expansion),
            vec!["test[python=3.6]", "test[python=3.7]", "test[python=3.8]"]
        );
    }

    #[test]
    fn test_first_axis_varies_slowest() {
        let template = JobTemplate::new("test")
            .axis("os", ["linux", "macos"])
            .axis("python", ["3.7", "3.8"]);
        let expansion = MatrixExpander::expand(&template);
        assert_eq!(
            ids(&expansion),
            vec![
                "test[os=linux, python=3.7]",
                "test[os=linux, python=3.8]",
                "test[os=macos, python=3.7]",
                "test[os=macos, python=3.8]",
            ]
        );
        // deterministic across calls
        assert_eq!(ids(&MatrixExpander::expand(&template)), ids(&expansion));
    }

    #[test]
    fn test_empty_axis_warns() {
        let template = JobTemplate::new("test")
            .axis("os", ["linux"])
            .axis("python", Vec::<&str>::new());
        let expansion = MatrixExpander::expand(&template);
        assert!(expansion.instances.is_empty());
        assert_eq!(expansion.warnings.len(), 1);
        assert!(expansion.warnings[0].contains("'python'"));
    }

    #[test]
    fn test_exclude() {
        let template = JobTemplate::new("test")
            .axis("os", ["linux", "windows"])
            .axis("python", ["3.7", "3.8"])
            .exclude([("os", "windows"), ("python", "3.7")]);
        let expansion = MatrixExpander::expand(&template);
        assert_eq!(
            ids(&expansion),
            vec![
                "test[os=linux, python=3.7]",
                "test[os=linux, python=3.8]",
                "test[os=windows, python=3.8]",
            ]
        );
    }

    #[test]
    fn test_exclude_loose_match() {
        let template = JobTemplate::new("test")
            .axis("python", [Value::from(3.7), Value::from(3.8)])
            .exclude([("python", "3.8")]);
        let expansion = MatrixExpander::expand(&template);
        assert_eq!(ids(&expansion), vec!["test[python=3.7]"]);
    }

    #[test]
    fn test_everything_excluded_warns() {
        let template = JobTemplate::new("test")
            .axis("os", ["linux"])
            .exclude([("os", "linux")]);
        let expansion = MatrixExpander::expand(&template);
        assert!(expansion.instances.is_empty());
        assert_eq!(expansion.warnings.len(), 1);
    }

    #[test]
    fn test_duplicate_points_dropped() {
        let template = JobTemplate::new("test").axis("python", ["3.7", "3.7", "3.8"]);
        let expansion = MatrixExpander::expand(&template);
        assert_eq!(ids(&expansion), vec!["test[python=3.7]", "test[python=3.8]"]);
        assert_eq!(expansion.warnings.len(), 1);
        assert!(expansion.warnings[0].contains("test[python=3.7]"));
    }

    #[test]
    fn test_numbers_rendering_alike_dropped() {
        let template = JobTemplate::new("test").axis("python", [Value::from(3.1), Value::from(3.10)]);
        let expansion = MatrixExpander::expand(&template);
        assert_eq!(ids(&expansion), vec!["test[python=3.1]"]);
        assert_eq!(expansion.warnings.len(), 1);
    }

    #[test]
    fn test_duplicate_axis_name_ignored() {
        let template = JobTemplate::new("test")
            .axis("python", ["3.7"])
            .axis("python", ["3.8", "3.9"]);
        let expansion = MatrixExpander::expand(&template);
        assert_eq!(ids(&expansion), vec!["test[python=3.7]"]);
        assert!(expansion.warnings[0].contains("declared twice"));
    }
}
