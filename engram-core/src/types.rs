//! Entity and relationship type enumerations.
//!
//! Both enums are compile-time closed sets with stable declaration-order
//! indexes. The indexes size the fixed-width statistics arrays, so new
//! variants must be appended at the end of their group block, never
//! inserted in the middle.

use serde::{Deserialize, Serialize};

macro_rules! entity_types {
    (
        $(#[$outer:meta])*
        $name:ident { $($variant:ident => $label:literal,)+ }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant,)+
        }

        impl $name {
            /// All variants in stable declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Number of variants; sizes the fixed statistics arrays.
            pub const COUNT: usize = Self::ALL.len();

            /// Stable index of this variant, usable as an array offset.
            pub fn index(&self) -> usize {
                *self as usize
            }

            /// Variant at a stable index, if in range.
            pub fn from_index(index: usize) -> Option<Self> {
                Self::ALL.get(index).copied()
            }

            /// The canonical wire label.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }

            /// Parse a canonical wire label.
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($label => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

entity_types! {
    /// The kind of a noun (entity).
    NounType {
        Person => "person",
        Organization => "organization",
        Location => "location",
        Place => "place",
        Event => "event",
        Document => "document",
        Message => "message",
        Concept => "concept",
        Topic => "topic",
        Product => "product",
        Service => "service",
        Task => "task",
        Project => "project",
        Goal => "goal",
        Question => "question",
        Answer => "answer",
        Idea => "idea",
        Note => "note",
        File => "file",
        Image => "image",
        Video => "video",
        Audio => "audio",
        Website => "website",
        Application => "application",
        Device => "device",
        Dataset => "dataset",
        Model => "model",
        Process => "process",
        State => "state",
        Collection => "collection",
        Tag => "tag",
        Category => "category",
        Skill => "skill",
        Tool => "tool",
        Language => "language",
        Currency => "currency",
        Date => "date",
        Quantity => "quantity",
        Measurement => "measurement",
        Media => "media",
        Hyperlink => "hyperlink",
        Thing => "thing",
    }
}

entity_types! {
    /// The kind of a verb (typed edge between two nouns).
    ///
    /// Most verbs come in active/passive pairs so traversals can be
    /// expressed from either endpoint without inverting at query time.
    VerbType {
        // Similarity and identity
        RelatedTo => "related_to",
        SimilarTo => "similar_to",
        OppositeOf => "opposite_of",
        SameAs => "same_as",
        DifferentFrom => "different_from",
        InstanceOf => "instance_of",
        TypeOf => "type_of",
        SubclassOf => "subclass_of",
        SynonymOf => "synonym_of",
        AntonymOf => "antonym_of",
        // Structure and membership
        Contains => "contains",
        ContainedIn => "contained_in",
        PartOf => "part_of",
        HasPart => "has_part",
        ComposedOf => "composed_of",
        ComponentOf => "component_of",
        MemberOf => "member_of",
        HasMember => "has_member",
        GroupedWith => "grouped_with",
        AttachedTo => "attached_to",
        ConnectedTo => "connected_to",
        LinkedTo => "linked_to",
        JoinedWith => "joined_with",
        Includes => "includes",
        ExcludedFrom => "excluded_from",
        // Creation and production
        Creates => "creates",
        CreatedBy => "created_by",
        Generates => "generates",
        GeneratedBy => "generated_by",
        Produces => "produces",
        ProducedBy => "produced_by",
        Builds => "builds",
        BuiltBy => "built_by",
        Writes => "writes",
        WrittenBy => "written_by",
        Designs => "designs",
        DesignedBy => "designed_by",
        Develops => "develops",
        DevelopedBy => "developed_by",
        Publishes => "publishes",
        PublishedBy => "published_by",
        // Transformation
        Modifies => "modifies",
        ModifiedBy => "modified_by",
        Updates => "updates",
        UpdatedBy => "updated_by",
        Transforms => "transforms",
        TransformedBy => "transformed_by",
        Converts => "converts",
        ConvertedBy => "converted_by",
        Improves => "improves",
        ImprovedBy => "improved_by",
        Fixes => "fixes",
        FixedBy => "fixed_by",
        Replaces => "replaces",
        ReplacedBy => "replaced_by",
        // Ownership and control
        Owns => "owns",
        OwnedBy => "owned_by",
        Manages => "manages",
        ManagedBy => "managed_by",
        Controls => "controls",
        ControlledBy => "controlled_by",
        Maintains => "maintains",
        MaintainedBy => "maintained_by",
        Administers => "administers",
        AdministeredBy => "administered_by",
        Supervises => "supervises",
        SupervisedBy => "supervised_by",
        // Usage and dependency
        Uses => "uses",
        UsedBy => "used_by",
        Requires => "requires",
        RequiredBy => "required_by",
        DependsOn => "depends_on",
        DependencyOf => "dependency_of",
        Consumes => "consumes",
        ConsumedBy => "consumed_by",
        Provides => "provides",
        ProvidedBy => "provided_by",
        Supports => "supports",
        SupportedBy => "supported_by",
        Implements => "implements",
        ImplementedBy => "implemented_by",
        Extends => "extends",
        ExtendedBy => "extended_by",
        // Spatial, temporal and causal
        LocatedAt => "located_at",
        LocationOf => "location_of",
        Near => "near",
        Inside => "inside",
        Outside => "outside",
        Above => "above",
        Below => "below",
        Precedes => "precedes",
        Follows => "follows",
        During => "during",
        Starts => "starts",
        Ends => "ends",
        Causes => "causes",
        CausedBy => "caused_by",
        Triggers => "triggers",
        TriggeredBy => "triggered_by",
        // Social and organizational
        Knows => "knows",
        KnownBy => "known_by",
        WorksWith => "works_with",
        WorksFor => "works_for",
        Employs => "employs",
        CollaboratesWith => "collaborates_with",
        CommunicatesWith => "communicates_with",
        ReportsTo => "reports_to",
        HasReport => "has_report",
        Teaches => "teaches",
        TaughtBy => "taught_by",
        Mentors => "mentors",
        MentoredBy => "mentored_by",
        SubscribesTo => "subscribes_to",
        SubscribedBy => "subscribed_by",
        Represents => "represents",
        // Reference and discourse
        References => "references",
        ReferencedBy => "referenced_by",
        Describes => "describes",
        DescribedBy => "described_by",
        Explains => "explains",
        ExplainedBy => "explained_by",
        Summarizes => "summarizes",
        SummarizedBy => "summarized_by",
        Answers => "answers",
        AnsweredBy => "answered_by",
        Asks => "asks",
        Mentions => "mentions",
    }
}

impl Default for NounType {
    fn default() -> Self {
        Self::Thing
    }
}

impl Default for VerbType {
    fn default() -> Self {
        Self::RelatedTo
    }
}
