//
// Copyright 2026 The Project Oak Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Publication of per-instance file endpoints.

use core::fmt::Display;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A character device number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevNum {
    pub major: u32,
    pub minor: u32,
}

impl Display for DevNum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Host facility that makes endpoints visible to callers.
pub trait NodePublisher: Send + Sync {
    /// Allocates `count` minors starting at `first_minor` and returns the
    /// major number.
    fn alloc_chrdev_region(
        &self,
        first_minor: u32,
        count: u32,
        name: &str,
    ) -> core::result::Result<u32, &'static str>;

    fn unregister_chrdev_region(&self, first: DevNum, count: u32);

    fn create_class(&self, name: &str) -> core::result::Result<(), &'static str>;

    fn destroy_class(&self, name: &str);

    fn publish(&self, class: &str, number: DevNum, node: &str)
        -> core::result::Result<(), &'static str>;

    fn unpublish(&self, class: &str, number: DevNum);
}

/// The device number range and the device class shared by all instances.
///
/// Created once when the driver starts; the class and the number range are
/// released when the last reference goes away.
pub struct PublishContext {
    publisher: Arc<dyn NodePublisher>,
    name: String,
    first: DevNum,
    count: u32,
}

impl PublishContext {
    pub fn create(
        publisher: Arc<dyn NodePublisher>,
        name: &str,
        count: usize,
    ) -> Result<Arc<Self>> {
        let count = u32::try_from(count).map_err(|_| Error::ConfigurationExceeded(count))?;
        let major = publisher.alloc_chrdev_region(0, count, name).map_err(|err| {
            log::error!("could not allocate device numbers: {}", err);
            Error::ResourceUnavailable(format!("device number allocation failed: {}", err))
        })?;
        let first = DevNum { major, minor: 0 };
        if let Err(err) = publisher.create_class(name) {
            log::error!("could not create class {}: {}", name, err);
            publisher.unregister_chrdev_region(first, count);
            return Err(Error::ResourceUnavailable(format!("class creation failed: {}", err)));
        }
        log::debug!("{}: allocated {} minors from {}", name, count, first);
        Ok(Arc::new(Self { publisher, name: name.to_string(), first, count }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dev_num(&self, index: usize) -> DevNum {
        DevNum { major: self.first.major, minor: self.first.minor + index as u32 }
    }

    /// Makes the endpoint for `index` visible as `node`.
    pub fn publish(&self, index: usize, node: &str) -> Result<()> {
        if index >= self.count as usize {
            return Err(Error::ConfigurationExceeded(self.count as usize));
        }
        self.publisher.publish(&self.name, self.dev_num(index), node).map_err(|err| {
            log::error!("could not publish {}: {}", node, err);
            Error::ResourceUnavailable(format!("publishing {} failed: {}", node, err))
        })
    }

    pub fn unpublish(&self, index: usize) {
        self.publisher.unpublish(&self.name, self.dev_num(index));
    }
}

impl Drop for PublishContext {
    fn drop(&mut self) {
        self.publisher.destroy_class(&self.name);
        self.publisher.unregister_chrdev_region(self.first, self.count);
        log::debug!("{}: released class and device numbers", self.name);
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;
    use crate::sim::SimPublisher;

    #[test]
    fn test_context_lifecycle() {
        let publisher = Arc::new(SimPublisher::default());
        let context = PublishContext::create(publisher.clone(), "vmsocket", 4).unwrap();
        assert_that!(publisher.has_class("vmsocket"), eq(true));
        assert_that!(publisher.allocated_regions(), eq(1));

        context.publish(2, "vmsocket2").unwrap();
        let minor = context.dev_num(2).minor;
        assert_that!(minor, eq(2));
        assert_eq!(publisher.nodes(), vec!["vmsocket2".to_string()]);
        context.unpublish(2);
        assert!(publisher.nodes().is_empty());

        let second = context.clone();
        drop(context);
        assert_that!(publisher.classes_destroyed(), eq(0));
        drop(second);
        assert_that!(publisher.classes_destroyed(), eq(1));
        assert_that!(publisher.allocated_regions(), eq(0));
    }

    #[test]
    fn test_publish_out_of_range() {
        let publisher = Arc::new(SimPublisher::default());
        let context = PublishContext::create(publisher, "vmsocket", 1).unwrap();
        assert!(context.publish(1, "vmsocket1").is_err());
    }

    #[test]
    fn test_publish_failure_is_reported() {
        let publisher = Arc::new(SimPublisher::default());
        publisher.fail_publish(true);
        let context = PublishContext::create(publisher.clone(), "vmsocket", 1).unwrap();
        assert!(matches!(context.publish(0, "vmsocket0"), Err(Error::ResourceUnavailable(_))));
        assert!(publisher.nodes().is_empty());
    }
}
