use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

const LIST: &str = "java/util/List";
const SET: &str = "java/util/Set";
const MAP: &str = "java/util/Map";

const OBJECT_TO_BOOLEAN: &str = "(Ljava/lang/Object;)Z";
const OBJECT_TO_INT: &str = "(Ljava/lang/Object;)I";
const OBJECT_TO_OBJECT: &str = "(Ljava/lang/Object;)Ljava/lang/Object;";

/// Exact `(owner, name, descriptor)` key of a collection method.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct RuleKey {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl RuleKey {
    pub(crate) fn new(owner: &str, name: &str, descriptor: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

/// Stack position inspected for a collection call.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum CheckPosition {
    /// Argument counted from the top of the stack before the call; 0 is the last argument.
    Argument(usize),
    /// The collection itself; its presence means the call's result is read out of it.
    Receiver,
}

/// Positions to inspect for one collection method.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ArgumentCheckSpec {
    positions: Vec<CheckPosition>,
}

impl ArgumentCheckSpec {
    pub(crate) fn new(positions: &[CheckPosition]) -> Self {
        Self {
            positions: positions.to_vec(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Argument depths in declaration order of the spec.
    pub(crate) fn argument_depths(&self) -> impl Iterator<Item = usize> + '_ {
        self.positions.iter().filter_map(|position| match position {
            CheckPosition::Argument(depth) => Some(*depth),
            CheckPosition::Receiver => None,
        })
    }

    /// Whether the call's result should be treated as derived from the field.
    pub(crate) fn tags_result(&self) -> bool {
        self.positions.contains(&CheckPosition::Receiver)
    }
}

/// Read-only lookup tables consulted by the impersonation scanner.
#[derive(Clone, Debug)]
pub(crate) struct RuleTables {
    collection_methods: BTreeMap<RuleKey, ArgumentCheckSpec>,
    string_parse_methods: BTreeSet<&'static str>,
    builder_types: BTreeSet<&'static str>,
}

impl RuleTables {
    /// Tables seeded with the JDK collection, string and builder APIs.
    pub(crate) fn jdk() -> Result<Self> {
        use CheckPosition::{Argument, Receiver};

        let value = [Argument(0)];
        let read_back = [Receiver, Argument(0)];
        let put = [Receiver, Argument(0), Argument(1)];

        let mut tables = Self {
            collection_methods: BTreeMap::new(),
            string_parse_methods: BTreeSet::from([
                "indexOf",
                "lastIndexOf",
                "substring",
                "split",
                "startsWith",
                "endsWith",
            ]),
            builder_types: BTreeSet::from(["java/lang/StringBuilder", "java/lang/StringBuffer"]),
        };

        tables.register(LIST, "contains", OBJECT_TO_BOOLEAN, &value)?;
        tables.register(LIST, "add", OBJECT_TO_BOOLEAN, &value)?;
        tables.register(LIST, "remove", OBJECT_TO_BOOLEAN, &value)?;
        tables.register(
            LIST,
            "set",
            "(ILjava/lang/Object;)Ljava/lang/Object;",
            &read_back,
        )?;
        tables.register(LIST, "add", "(ILjava/lang/Object;)V", &value)?;
        tables.register(LIST, "indexOf", OBJECT_TO_INT, &value)?;
        tables.register(LIST, "lastIndexOf", OBJECT_TO_INT, &value)?;

        tables.register(SET, "contains", OBJECT_TO_BOOLEAN, &value)?;
        tables.register(SET, "add", OBJECT_TO_BOOLEAN, &value)?;
        tables.register(SET, "remove", OBJECT_TO_BOOLEAN, &value)?;

        tables.register(MAP, "containsKey", OBJECT_TO_BOOLEAN, &value)?;
        tables.register(MAP, "containsValue", OBJECT_TO_BOOLEAN, &value)?;
        tables.register(MAP, "get", OBJECT_TO_OBJECT, &read_back)?;
        tables.register(
            MAP,
            "put",
            "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;",
            &put,
        )?;
        tables.register(MAP, "remove", OBJECT_TO_OBJECT, &read_back)?;

        Ok(tables)
    }

    /// Add a collection method; registering the same key twice is an error.
    pub(crate) fn register(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        positions: &[CheckPosition],
    ) -> Result<()> {
        let key = RuleKey::new(owner, name, descriptor);
        if self.collection_methods.contains_key(&key) {
            anyhow::bail!("duplicate collection rule: {owner}.{name}{descriptor}");
        }
        self.collection_methods
            .insert(key, ArgumentCheckSpec::new(positions));
        Ok(())
    }

    pub(crate) fn collection_method(
        &self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Option<&ArgumentCheckSpec> {
        self.collection_methods
            .get(&RuleKey::new(owner, name, descriptor))
    }

    /// String parsing methods are matched by name alone, whatever the overload.
    pub(crate) fn is_string_parse_method(&self, name: &str) -> bool {
        self.string_parse_methods.contains(name)
    }

    pub(crate) fn is_builder_type(&self, owner: &str) -> bool {
        self.builder_types.contains(owner)
    }

    #[cfg(test)]
    pub(crate) fn collection_entries(
        &self,
    ) -> impl Iterator<Item = (&RuleKey, &ArgumentCheckSpec)> {
        self.collection_methods.iter()
    }
}
