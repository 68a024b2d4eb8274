use std::path::Path;

use crate::resources::Resources;

pub(super) trait Controller {
    type Error;

    /// Writes the part of `resources` this controller owns into the cgroup directory
    fn apply(resources: &Resources, cgroup_path: &Path) -> Result<(), Self::Error>;
}
