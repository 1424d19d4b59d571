//! Built-in taxonomy
//!
//! Category forest and starter word mappings installed on first init.
//! Paths are slash-delimited; every parent precedes its children so the
//! store's parent-must-exist rule holds during seeding.

/// (path, category_type, description)
pub const CATEGORIES: &[(&str, &str, &str)] = &[
    // Subject tree
    ("subject", "subject", "Main subject matter"),
    ("subject/person", "subject", "Human subjects"),
    ("subject/person/man", "subject", "Adult male"),
    ("subject/person/woman", "subject", "Adult female"),
    ("subject/person/child", "subject", "Children"),
    ("subject/person/elderly", "subject", "Elderly person"),
    ("subject/person/figure", "subject", "Body type and build"),
    ("subject/person/hair", "subject", "Hair characteristics"),
    ("subject/person/hair/length", "subject", "Hair length"),
    ("subject/person/hair/color", "subject", "Hair color"),
    ("subject/person/hair/style", "subject", "Hair styling"),
    ("subject/person/expression", "subject", "Facial expressions"),
    ("subject/person/action", "subject", "Person activities"),
    ("subject/clothing", "subject", "Clothing and attire"),
    ("subject/clothing/upper_body", "subject", "Upper body clothing"),
    ("subject/clothing/lower_body", "subject", "Lower body clothing"),
    ("subject/clothing/dress", "subject", "Dresses"),
    ("subject/clothing/footwear", "subject", "Shoes and footwear"),
    ("subject/animal", "subject", "Animal subjects"),
    // Style tree
    ("style", "style", "Artistic and visual styles"),
    ("style/medium", "style", "Artistic medium"),
    ("style/medium/photography", "style", "Photography"),
    ("style/medium/painting", "style", "Painting"),
    ("style/medium/digital_art", "style", "Digital artwork"),
    ("style/medium/sketch", "style", "Sketch or drawing"),
    ("style/movement", "style", "Artistic movements"),
    ("style/modern", "style", "Modern art styles"),
    ("style/modern/cyberpunk", "style", "Cyberpunk aesthetic"),
    ("style/modern/steampunk", "style", "Steampunk aesthetic"),
    ("style/modern/gothic", "style", "Gothic style"),
    ("style/modern/minimalist", "style", "Minimalist style"),
    ("style/quality", "style", "Quality and detail"),
    ("style/quality/high_quality", "style", "High quality"),
    ("style/quality/detailed", "style", "Highly detailed"),
    ("style/quality/masterpiece", "style", "Masterpiece quality"),
    ("style/quality/professional", "style", "Professional quality"),
    // Environment tree
    ("environment", "environment", "Settings and environments"),
    ("environment/indoor", "environment", "Indoor setting"),
    ("environment/outdoor", "environment", "Outdoor setting"),
    ("environment/outdoor/park", "environment", "Park setting"),
    ("environment/outdoor/beach", "environment", "Beach setting"),
    ("environment/outdoor/forest", "environment", "Forest setting"),
    ("environment/outdoor/city", "environment", "Urban setting"),
    ("environment/time_period", "environment", "Historical periods"),
    ("environment/time_period/modern", "environment", "Modern day"),
    ("environment/time_period/medieval", "environment", "Medieval period"),
    ("environment/time_period/futuristic", "environment", "Future setting"),
    ("environment/time_period/ancient", "environment", "Ancient times"),
    ("environment/lighting", "environment", "Lighting conditions"),
    ("environment/lighting/natural", "environment", "Natural lighting"),
    ("environment/lighting/dramatic", "environment", "Dramatic lighting"),
    ("environment/lighting/soft", "environment", "Soft lighting"),
    ("environment/lighting/neon", "environment", "Neon lighting"),
    // Surreal tree
    ("surreal", "surreal", "Surreal and abstract elements"),
    ("surreal/distortion", "surreal", "Visual distortions"),
    ("surreal/impossible", "surreal", "Impossible imagery"),
    // Motif tree
    ("motif", "motif", "Themes and symbolic elements"),
    ("motif/mood", "motif", "Emotional mood"),
    ("motif/mood/dark", "motif", "Dark mood"),
    ("motif/mood/cheerful", "motif", "Cheerful mood"),
    ("motif/mood/mysterious", "motif", "Mysterious mood"),
    ("motif/mood/romantic", "motif", "Romantic mood"),
    ("motif/theme", "motif", "Thematic elements"),
    ("motif/theme/nature", "motif", "Nature theme"),
    ("motif/theme/technology", "motif", "Technology theme"),
    // Content filter tree
    ("content_filter", "content_filter", "Content filtering"),
    ("content_filter/nsfw", "content_filter", "NSFW content"),
    ("content_filter/nsfw/nudity", "content_filter", "Nudity"),
    ("content_filter/nsfw/sexual", "content_filter", "Sexual content"),
    ("content_filter/nsfw/suggestive", "content_filter", "Suggestive content"),
    ("content_filter/violence", "content_filter", "Violent content"),
    ("content_filter/violence/weapons", "content_filter", "Weapons"),
    ("content_filter/violence/gore", "content_filter", "Gore"),
];

/// (word, category path, confidence)
pub const WORDS: &[(&str, &str, f64)] = &[
    // People
    ("woman", "subject/person/woman", 1.0),
    ("man", "subject/person/man", 1.0),
    ("lady", "subject/person/woman", 0.9),
    ("girl", "subject/person/child", 1.0),
    ("boy", "subject/person/child", 1.0),
    ("elderly", "subject/person/elderly", 1.0),
    // Hair
    ("hair", "subject/person/hair", 1.0),
    ("blonde", "subject/person/hair/color", 1.0),
    ("brunette", "subject/person/hair/color", 1.0),
    ("ponytail", "subject/person/hair/style", 1.0),
    ("braided", "subject/person/hair/style", 1.0),
    // Expressions and actions
    ("smiling", "subject/person/expression", 1.0),
    ("serious", "subject/person/expression", 1.0),
    ("sitting", "subject/person/action", 1.0),
    ("standing", "subject/person/action", 1.0),
    ("walking", "subject/person/action", 1.0),
    ("running", "subject/person/action", 1.0),
    ("dancing", "subject/person/action", 1.0),
    // Clothing
    ("dress", "subject/clothing/dress", 1.0),
    ("jacket", "subject/clothing/upper_body", 1.0),
    ("skirt", "subject/clothing/lower_body", 1.0),
    ("boots", "subject/clothing/footwear", 1.0),
    // Animals
    ("cat", "subject/animal", 0.9),
    ("dog", "subject/animal", 0.9),
    // Quality
    ("beautiful", "style/quality/high_quality", 0.8),
    ("elegant", "style/quality/high_quality", 0.8),
    ("detailed", "style/quality/detailed", 1.0),
    ("professional", "style/quality/professional", 1.0),
    ("masterpiece", "style/quality/masterpiece", 1.0),
    // Mediums
    ("photo", "style/medium/photography", 1.0),
    ("photograph", "style/medium/photography", 1.0),
    ("portrait", "style/medium/photography", 0.7),
    ("painting", "style/medium/painting", 1.0),
    ("sketch", "style/medium/sketch", 1.0),
    ("digital", "style/medium/digital_art", 1.0),
    ("anime", "style/medium/digital_art", 0.8),
    // Modern styles
    ("cyberpunk", "style/modern/cyberpunk", 1.0),
    ("steampunk", "style/modern/steampunk", 1.0),
    ("gothic", "style/modern/gothic", 1.0),
    ("minimalist", "style/modern/minimalist", 1.0),
    // Environments
    ("park", "environment/outdoor/park", 1.0),
    ("beach", "environment/outdoor/beach", 1.0),
    ("forest", "environment/outdoor/forest", 1.0),
    ("city", "environment/outdoor/city", 1.0),
    ("indoors", "environment/indoor", 0.9),
    ("outdoors", "environment/outdoor", 0.9),
    ("sunset", "environment/lighting/natural", 0.7),
    ("sunlight", "environment/lighting/natural", 0.9),
    ("neon", "environment/lighting/neon", 1.0),
    ("candlelight", "environment/lighting/soft", 0.9),
    ("dramatic lighting", "environment/lighting/dramatic", 1.0),
    ("soft lighting", "environment/lighting/soft", 1.0),
    // Time periods
    ("modern", "environment/time_period/modern", 1.0),
    ("medieval", "environment/time_period/medieval", 1.0),
    ("futuristic", "environment/time_period/futuristic", 1.0),
    ("ancient", "environment/time_period/ancient", 1.0),
    // Surreal
    ("melting", "surreal/distortion", 1.0),
    ("floating", "surreal/impossible", 0.9),
    // Mood
    ("dark", "motif/mood/dark", 0.8),
    ("cheerful", "motif/mood/cheerful", 1.0),
    ("mysterious", "motif/mood/mysterious", 1.0),
    ("romantic", "motif/mood/romantic", 1.0),
    // Content filter: explicit
    ("nude", "content_filter/nsfw/nudity", 1.0),
    ("naked", "content_filter/nsfw/nudity", 1.0),
    ("topless", "content_filter/nsfw/nudity", 0.9),
    ("nsfw", "content_filter/nsfw", 1.0),
    ("explicit", "content_filter/nsfw", 0.9),
    ("sexual", "content_filter/nsfw/sexual", 1.0),
    // Content filter: suggestive (lower confidence, below the explicit band)
    ("suggestive", "content_filter/nsfw/suggestive", 0.4),
    ("lingerie", "content_filter/nsfw/suggestive", 0.4),
    ("seductive", "content_filter/nsfw/suggestive", 0.3),
    // Content filter: violence
    ("gore", "content_filter/violence/gore", 1.0),
    ("blood", "content_filter/violence/gore", 0.6),
    ("sword", "content_filter/violence/weapons", 0.5),
    ("gun", "content_filter/violence/weapons", 0.7),
];
